//! Artifact hand-off between the scan job and the upload job.
//!
//! The extractor runs next to the scanners and pushes every artifact to the receiver,
//! an init container of the upload job reached through the pipeline's upload
//! Service. One `PUT /artifacts?path=<absolute path>` carries one file; the sender
//! posts `/complete` when it gives up on some of them so the receiver stops waiting.
mod extract;
mod receive;

pub use extract::{ExtractReport, Extractor};
pub use receive::{ReceiveReport, Receiver};

pub const ARTIFACTS_PATH: &str = "/artifacts";
pub const COMPLETE_PATH: &str = "/complete";
pub const HEALTH_PATH: &str = "/healthz";

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, path::Path};

    use tokio_util::sync::CancellationToken;

    use super::*;

    fn artifact(dir: &Path, name: &str) -> String {
        dir.join(name).to_string_lossy().into_owned()
    }

    async fn receiver(root: &Path, files: &[String]) -> (Receiver, SocketAddr) {
        let receiver = Receiver::bind(SocketAddr::from(([127, 0, 0, 1], 0)), root, files.to_vec())
            .await
            .unwrap();
        let addr = receiver.local_addr().unwrap();
        (receiver, addr)
    }

    #[tokio::test]
    async fn artifacts_arrive_under_receiver_root() {
        let scan = tempfile::tempdir().unwrap();
        let upload = tempfile::tempdir().unwrap();
        let files = vec![artifact(scan.path(), "report.json"), artifact(scan.path(), "nested/sbom.json")];
        std::fs::write(&files[0], br#"{"findings":[]}"#).unwrap();
        std::fs::create_dir_all(scan.path().join("nested")).unwrap();
        std::fs::write(&files[1], b"sbom").unwrap();

        let (receiver, addr) = receiver(upload.path(), &files).await;
        let serving = tokio::spawn(receiver.run(CancellationToken::new()));

        let report = Extractor::new("127.0.0.1", addr.port()).push_all(&files).await;
        assert_eq!(report.delivered, files);
        assert!(report.failed.is_empty());

        // stops on its own once everything arrived
        let received = serving.await.unwrap().unwrap();
        assert!(received.missing.is_empty());
        let copy = upload.path().join(files[0].trim_start_matches('/'));
        assert_eq!(std::fs::read(copy).unwrap(), br#"{"findings":[]}"#);
        let copy = upload.path().join(files[1].trim_start_matches('/'));
        assert_eq!(std::fs::read(copy).unwrap(), b"sbom");
    }

    #[tokio::test]
    async fn unreadable_artifact_completes_the_receiver() {
        let scan = tempfile::tempdir().unwrap();
        let upload = tempfile::tempdir().unwrap();
        let files = vec![artifact(scan.path(), "present.txt"), artifact(scan.path(), "absent.txt")];
        std::fs::write(&files[0], b"ok").unwrap();

        let (receiver, addr) = receiver(upload.path(), &files).await;
        let serving = tokio::spawn(receiver.run(CancellationToken::new()));

        let report = Extractor::new("127.0.0.1", addr.port()).push_all(&files).await;
        assert_eq!(report.delivered, [files[0].clone()]);
        assert_eq!(report.failed, [files[1].clone()]);

        let received = serving.await.unwrap().unwrap();
        assert_eq!(received.missing, [files[1].clone()]);
    }

    #[tokio::test]
    async fn receiver_stops_on_signal_with_nothing_received() {
        let upload = tempfile::tempdir().unwrap();
        let files = vec!["/mnt/results/report.json".to_string()];
        let (receiver, _) = receiver(upload.path(), &files).await;
        let token = CancellationToken::new();
        let serving = tokio::spawn(receiver.run(token.clone()));
        token.cancel();
        let received = serving.await.unwrap().unwrap();
        assert_eq!(received.missing, files);
    }

    #[tokio::test]
    async fn unexpected_path_is_rejected() {
        let scan = tempfile::tempdir().unwrap();
        let upload = tempfile::tempdir().unwrap();
        let stray = artifact(scan.path(), "stray.txt");
        std::fs::write(&stray, b"?").unwrap();

        let (receiver, addr) = receiver(upload.path(), &["/mnt/results/report.json".to_string()]).await;
        let token = CancellationToken::new();
        let serving = tokio::spawn(receiver.run(token.clone()));

        let report = Extractor::new("127.0.0.1", addr.port()).push_all(&[stray]).await;
        assert_eq!(report.failed.len(), 1);
        token.cancel();
        serving.await.unwrap().unwrap();
    }
}
