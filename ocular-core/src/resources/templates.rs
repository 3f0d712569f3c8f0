//! Downloaders, uploaders and crawlers: container templates with a parameter schema.
//!
//! Each comes in a namespaced and a cluster-scoped flavour. References select the
//! flavour through a kind enum rather than a free-form string.
use k8s_openapi::api::core::v1::Container;
use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::ValidationStatus;
use crate::params::{ParameterDefinition, ParameterSetting};

/// Read access shared by every template spec.
pub trait ContainerTemplate {
    fn container(&self) -> &Container;
    fn parameters(&self) -> &[ParameterDefinition];
}

/// A custom resource wrapping a [`ContainerTemplate`].
pub trait TemplateResource:
    Resource<DynamicType = ()> + Clone + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn template(&self) -> &dyn ContainerTemplate;
    fn validation(&self) -> Option<&ValidationStatus>;
}

macro_rules! container_template {
    ($(#[$doc:meta])* $root:ident, $spec:ident, $kind:tt, $short:tt $(, $scope:tt)?) => {
        $(#[$doc])*
        #[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
        #[kube(group = "ocular.crashoverride.run", version = "v1beta1", kind = $kind, shortname = $short)]
        #[kube(status = "ValidationStatus" $(, $scope)?)]
        #[kube(printcolumn = r#"{"name":"Valid","type":"boolean","jsonPath":".status.valid"}"#)]
        #[serde(rename_all = "camelCase")]
        pub struct $spec {
            pub container: Container,
            #[serde(default, skip_serializing_if = "Vec::is_empty")]
            pub parameters: Vec<ParameterDefinition>,
        }

        impl ContainerTemplate for $spec {
            fn container(&self) -> &Container {
                &self.container
            }

            fn parameters(&self) -> &[ParameterDefinition] {
                &self.parameters
            }
        }

        impl TemplateResource for $root {
            fn template(&self) -> &dyn ContainerTemplate {
                &self.spec
            }

            fn validation(&self) -> Option<&ValidationStatus> {
                self.status.as_ref()
            }
        }
    };
}

container_template!(
    /// Fetches a target into the target directory before scanning.
    Downloader, DownloaderSpec, "Downloader", "dl", namespaced
);
container_template!(
    /// Cluster-wide [`Downloader`].
    ClusterDownloader, ClusterDownloaderSpec, "ClusterDownloader", "cdl"
);
container_template!(
    /// Ships extracted artifacts somewhere.
    Uploader, UploaderSpec, "Uploader", "up", namespaced
);
container_template!(
    /// Cluster-wide [`Uploader`].
    ClusterUploader, ClusterUploaderSpec, "ClusterUploader", "cup"
);
container_template!(
    /// Discovers targets and feeds them to the search scheduler.
    Crawler, CrawlerSpec, "Crawler", "cr", namespaced
);
container_template!(
    /// Cluster-wide [`Crawler`].
    ClusterCrawler, ClusterCrawlerSpec, "ClusterCrawler", "ccr"
);

/// Which downloader resource a reference points at.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum DownloaderKind {
    #[default]
    Downloader,
    ClusterDownloader,
}

/// Which crawler resource a reference points at.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum CrawlerKind {
    #[default]
    Crawler,
    ClusterCrawler,
}

/// Reference to a downloader with the parameter values to run it with.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct DownloaderRef {
    pub name: String,
    #[serde(default)]
    pub kind: DownloaderKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ParameterSetting>,
}

/// Reference to a crawler with the parameter values to run it with.
///
/// This is also the record format of the search FIFO.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CrawlerRef {
    pub name: String,
    #[serde(default)]
    pub kind: CrawlerKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ParameterSetting>,
}
