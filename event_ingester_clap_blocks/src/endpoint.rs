use std::str::FromStr;

use url::Url;

/// Custom endpoint for an AWS service, e.g. LocalStack, MinIO or ElasticMQ.
///
/// This is a valid [`Url`] without a trailing slash.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Endpoint> for String {
    fn from(value: Endpoint) -> Self {
        value.0
    }
}

impl FromStr for Endpoint {
    type Err = url::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Url::parse(s)?;

        let s = s.strip_suffix('/').unwrap_or(s);
        Ok(Self(s.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_trailing_slash() {
        let endpoint: Endpoint = "http://localhost:4566/".parse().unwrap();
        assert_eq!(endpoint.as_str(), "http://localhost:4566");

        let endpoint: Endpoint = "https://sqs.eu-west-1.amazonaws.com".parse().unwrap();
        assert_eq!(String::from(endpoint), "https://sqs.eu-west-1.amazonaws.com");
    }

    #[test]
    fn rejects_relative_urls() {
        assert_eq!(
            "sqs.local".parse::<Endpoint>().unwrap_err(),
            url::ParseError::RelativeUrlWithoutBase
        );
    }
}
