//! Resolving downloader, uploader and crawler references.
//!
//! A reference names either the namespaced or the cluster-scoped flavour of a
//! template. Both resolve into the same [`ResolvedTemplate`] so that the rest of the
//! reconcilers never look at the kind again.
use k8s_openapi::{api::core::v1::{Container, EnvVar}, NamespaceResourceScope};
use kube::{Api, Client, Resource, ResourceExt};
use ocular_core::{
    params::{self, ParameterDefinition, ParameterError, ParameterSetting},
    resources::{
        ClusterCrawler, ClusterDownloader, ClusterUploader, Crawler, CrawlerKind, CrawlerRef, Downloader,
        DownloaderKind, DownloaderRef, TemplateResource, Uploader, UploaderKind, UploaderRef, ValidationStatus,
        Validity,
    },
};

use crate::error::Result;

/// A container template after reference resolution.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedTemplate {
    pub kind: String,
    pub name: String,
    pub container: Container,
    pub parameters: Vec<ParameterDefinition>,
    pub validity: Validity,
}

impl ResolvedTemplate {
    fn from_resource<K: TemplateResource>(obj: &K) -> Self {
        let template = obj.template();
        Self {
            kind: K::kind(&()).to_string(),
            name: obj.name_any(),
            container: template.container().clone(),
            parameters: template.parameters().to_vec(),
            validity: ValidationStatus::validity(obj.validation()),
        }
    }

    /// Parameter environment variables for `settings`.
    pub fn parameter_env(&self, settings: &[ParameterSetting]) -> Result<Vec<EnvVar>, ParameterError> {
        params::resolve(&self.parameters, settings).map(|resolved| params::env_vars(&resolved))
    }
}

async fn namespaced<K>(client: &Client, namespace: &str, name: &str) -> Result<Option<ResolvedTemplate>>
where
    K: TemplateResource + Resource<Scope = NamespaceResourceScope>,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    Ok(api.get_opt(name).await?.as_ref().map(ResolvedTemplate::from_resource))
}

async fn cluster<K: TemplateResource>(client: &Client, name: &str) -> Result<Option<ResolvedTemplate>> {
    let api: Api<K> = Api::all(client.clone());
    Ok(api.get_opt(name).await?.as_ref().map(ResolvedTemplate::from_resource))
}

/// Look up the downloader a pipeline in `namespace` refers to.
pub async fn downloader(client: &Client, namespace: &str, r: &DownloaderRef) -> Result<Option<ResolvedTemplate>> {
    match r.kind {
        DownloaderKind::Downloader => namespaced::<Downloader>(client, namespace, &r.name).await,
        DownloaderKind::ClusterDownloader => cluster::<ClusterDownloader>(client, &r.name).await,
    }
}

/// Look up the uploader a profile in `namespace` refers to.
pub async fn uploader(client: &Client, namespace: &str, r: &UploaderRef) -> Result<Option<ResolvedTemplate>> {
    match r.kind {
        UploaderKind::Uploader => namespaced::<Uploader>(client, namespace, &r.name).await,
        UploaderKind::ClusterUploader => cluster::<ClusterUploader>(client, &r.name).await,
    }
}

/// Look up the crawler a search in `namespace` refers to.
pub async fn crawler(client: &Client, namespace: &str, r: &CrawlerRef) -> Result<Option<ResolvedTemplate>> {
    match r.kind {
        CrawlerKind::Crawler => namespaced::<Crawler>(client, namespace, &r.name).await,
        CrawlerKind::ClusterCrawler => cluster::<ClusterCrawler>(client, &r.name).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocular_core::resources::{ClusterCrawlerSpec, CrawlerSpec};

    #[tokio::test]
    async fn kind_selects_scope() {
        let (client, fake) = ocular_test::testcontext();
        let mut local = Crawler::new(
            "github",
            CrawlerSpec {
                container: Container {
                    name: "local".into(),
                    ..Default::default()
                },
                parameters: Vec::new(),
            },
        );
        local.metadata.namespace = Some("ns".into());
        local.status = Some(ValidationStatus {
            valid: Some(true),
            ..Default::default()
        });
        fake.seed(&local);
        fake.seed(&ClusterCrawler::new(
            "github",
            ClusterCrawlerSpec {
                container: Container {
                    name: "cluster".into(),
                    ..Default::default()
                },
                parameters: Vec::new(),
            },
        ));

        let mut r = CrawlerRef {
            name: "github".into(),
            ..Default::default()
        };
        let found = crawler(&client, "ns", &r).await.unwrap().unwrap();
        assert_eq!(found.container.name, "local");
        assert_eq!(found.validity, Validity::Valid);

        r.kind = CrawlerKind::ClusterCrawler;
        let found = crawler(&client, "ns", &r).await.unwrap().unwrap();
        assert_eq!(found.container.name, "cluster");
        assert_eq!(found.kind, "ClusterCrawler");
        assert_eq!(found.validity, Validity::Pending);

        r.name = "gitlab".into();
        assert!(crawler(&client, "ns", &r).await.unwrap().is_none());
    }
}
