use async_trait::async_trait;

use crate::domain::network::NetworkRequest;

/// Vetoes tracking of individual requests.
#[async_trait]
pub trait RequestInterceptor: Send + Sync {
    /// Return `true` to leave `request` out of idle detection.
    async fn should_ignore(&self, request: &NetworkRequest) -> bool;
}

/// Ignores every request whose URL starts with one of the configured
/// prefixes. Long-polling endpoints and analytics beacons are typical
/// entries.
#[derive(Debug, Clone, Default)]
pub struct IgnoreUrlPrefixes {
    prefixes: Vec<String>,
}

impl IgnoreUrlPrefixes {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(Into::into)
                .filter(|prefix: &String| !prefix.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}

#[async_trait]
impl RequestInterceptor for IgnoreUrlPrefixes {
    async fn should_ignore(&self, request: &NetworkRequest) -> bool {
        self.prefixes
            .iter()
            .any(|prefix| request.url.starts_with(prefix.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::network::ResourceType;

    #[tokio::test]
    async fn matches_configured_prefixes_only() {
        let interceptor = IgnoreUrlPrefixes::new(["https://analytics.example/", ""]);
        assert!(!interceptor.is_empty());

        let beacon = NetworkRequest::new("1", "https://analytics.example/collect", ResourceType::Xhr);
        let asset = NetworkRequest::new("2", "https://cdn.example/app.js", ResourceType::Script);

        assert!(interceptor.should_ignore(&beacon).await);
        assert!(!interceptor.should_ignore(&asset).await);
    }

    #[test]
    fn empty_prefixes_are_dropped() {
        assert!(IgnoreUrlPrefixes::new(Vec::<String>::new()).is_empty());
        assert!(IgnoreUrlPrefixes::new([""]).is_empty());
    }
}
