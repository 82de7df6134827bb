//! Image resolution for node and load balancer containers

use semver::Version;

/// Repository kind node images are published under
pub const NODE_IMAGE_REPOSITORY: &str = "kindest/node";

/// Load balancer image name
pub const LOAD_BALANCER_IMAGE: &str = "haproxy";

/// Default repository for the load balancer image
pub const DEFAULT_LOAD_BALANCER_REPOSITORY: &str = "kindest";

/// Default tag for the load balancer image
pub const DEFAULT_LOAD_BALANCER_TAG: &str = "v20230510-486859a6";

/// Maps a desired node version to a container image
pub trait ImageResolver: Send + Sync {
    /// Resolve the image for `version`. A non-empty `custom_image` always wins.
    fn resolve(&self, version: &Version, custom_image: Option<&str>) -> String;
}

/// Resolver producing `kindest/node:v<major>.<minor>.<patch>` images
#[derive(Debug, Clone, Default)]
pub struct KindImageResolver;

impl ImageResolver for KindImageResolver {
    fn resolve(&self, version: &Version, custom_image: Option<&str>) -> String {
        match custom_image {
            Some(image) if !image.is_empty() => image.to_string(),
            _ => format!(
                "{}:v{}.{}.{}",
                NODE_IMAGE_REPOSITORY, version.major, version.minor, version.patch
            ),
        }
    }
}

/// Parse a Kubernetes version string, tolerating a leading `v`
pub fn parse_version(version: &str) -> Result<Version, semver::Error> {
    Version::parse(version.strip_prefix('v').unwrap_or(version))
}

/// Image for the load balancer, e.g. "kindest/haproxy:v20230510-486859a6"
pub fn load_balancer_image(repository: Option<&str>, tag: Option<&str>) -> String {
    let repository = repository
        .filter(|r| !r.is_empty())
        .unwrap_or(DEFAULT_LOAD_BALANCER_REPOSITORY);
    let tag = tag.filter(|t| !t.is_empty()).unwrap_or(DEFAULT_LOAD_BALANCER_TAG);
    format!("{}/{}:{}", repository, LOAD_BALANCER_IMAGE, tag)
}
