//! Rewriting of cluster-internal links in HTML outputs.
//!
//! Spark kernels emit links to hosts that only resolve inside the cluster
//! (`master-0.../proxy`, `sparkhead-0.../proxy`, `storage-0.../containerlogs`).
//! Those are redirected through the cluster's public gateway endpoint.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use url::Url;

use crate::output::Output;

pub const DEFAULT_GATEWAY_PORT: &str = ":30433";
pub const YARN_UI_PATH: &str = "/gateway/default/yarn/proxy";
pub const DRIVER_LOG_PATH: &str = "/gateway/default/yarn/container";

/// Host and port of the gateway that internal links are routed through.
///
/// `port` keeps its leading colon so it can be spliced into a URL directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayAddress {
    pub host: String,
    pub port: String,
}

impl GatewayAddress {
    /// Build an address from an endpoint URL such as `https://10.0.0.4:30443`.
    ///
    /// A missing host falls back to `fallback_host`, a missing port to
    /// `default_port`.
    pub fn from_endpoint(endpoint: &str, fallback_host: &str, default_port: &str) -> Self {
        let parsed = Url::parse(endpoint).ok();
        let host = parsed
            .as_ref()
            .and_then(|u| u.host_str())
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| fallback_host.to_string());
        let port = parsed
            .as_ref()
            .and_then(|u| u.port())
            .map(|p| format!(":{}", p))
            .unwrap_or_else(|| default_port.to_string());
        GatewayAddress { host, port }
    }
}

struct LinkPattern {
    regex: Regex,
    target: &'static str,
}

fn link_patterns() -> &'static [LinkPattern] {
    static PATTERNS: OnceLock<Vec<LinkPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // Older clusters
            (r"(https?://master.*/proxy)(.*)", YARN_UI_PATH),
            (r"(https?://sparkhead.*/proxy)(.*)", YARN_UI_PATH),
            // Driver logs
            (r"(https?://storage.*/containerlogs)(.*)", DRIVER_LOG_PATH),
        ]
        .into_iter()
        .filter_map(|(pattern, target)| match Regex::new(pattern) {
            Ok(regex) => Some(LinkPattern { regex, target }),
            Err(e) => {
                log::error!("[gateway] Invalid link pattern {}: {}", pattern, e);
                None
            }
        })
        .collect()
    })
}

/// Rewrite every internal proxy link in `html` to go through `gateway`.
pub fn rewrite_gateway_links(html: &str, gateway: &GatewayAddress) -> String {
    let mut html = html.to_string();
    for pattern in link_patterns() {
        html = pattern
            .regex
            .replace_all(&html, |caps: &Captures| {
                let mut rewritten = String::new();
                if caps.get(1).is_some_and(|m| !m.as_str().is_empty()) {
                    rewritten.push_str("https://");
                    rewritten.push_str(&gateway.host);
                    rewritten.push_str(&gateway.port);
                    rewritten.push_str(pattern.target);
                }
                if let Some(rest) = caps.get(2) {
                    rewritten.push_str(rest.as_str());
                }
                rewritten
            })
            .into_owned();
    }
    html
}

/// Apply [`rewrite_gateway_links`] to an output's `text/html` payload.
///
/// Returns whether the output was changed.
pub fn rewrite_output_links(output: &mut Output, gateway: &GatewayAddress) -> bool {
    let Some(html) = output.html() else {
        return false;
    };
    let rewritten = rewrite_gateway_links(&html, gateway);
    if rewritten == html {
        return false;
    }
    match output.data_mut() {
        Some(data) => {
            data.insert("text/html".to_string(), rewritten.into());
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gateway() -> GatewayAddress {
        GatewayAddress {
            host: "gw.example.com".into(),
            port: ":30443".into(),
        }
    }

    #[test]
    fn test_from_endpoint_parses_host_and_port() {
        let addr = GatewayAddress::from_endpoint("https://10.1.2.3:30443", "srv", DEFAULT_GATEWAY_PORT);
        assert_eq!(addr.host, "10.1.2.3");
        assert_eq!(addr.port, ":30443");
    }

    #[test]
    fn test_from_endpoint_falls_back() {
        let addr = GatewayAddress::from_endpoint("not a url", "srv", DEFAULT_GATEWAY_PORT);
        assert_eq!(addr.host, "srv");
        assert_eq!(addr.port, ":30433");

        let addr = GatewayAddress::from_endpoint("https://gw.local", "srv", DEFAULT_GATEWAY_PORT);
        assert_eq!(addr.host, "gw.local");
        assert_eq!(addr.port, ":30433");
    }

    #[test]
    fn test_rewrite_sparkhead_link() {
        let html = "http://sparkhead-0.svc:8088/proxy/application_1/";
        assert_eq!(
            rewrite_gateway_links(html, &gateway()),
            "https://gw.example.com:30443/gateway/default/yarn/proxy/application_1/"
        );
    }

    #[test]
    fn test_rewrite_master_and_driver_links() {
        assert_eq!(
            rewrite_gateway_links("https://master-0.svc/proxy/app_2", &gateway()),
            "https://gw.example.com:30443/gateway/default/yarn/proxy/app_2"
        );
        assert_eq!(
            rewrite_gateway_links("http://storage-0-0.svc:8042/containerlogs/c_1/root", &gateway()),
            "https://gw.example.com:30443/gateway/default/yarn/container/c_1/root"
        );
    }

    #[test]
    fn test_unrelated_html_is_untouched() {
        let html = "<a href=\"https://docs.example.com/page\">docs</a>";
        assert_eq!(rewrite_gateway_links(html, &gateway()), html);
    }

    #[test]
    fn test_rewrite_output_links_only_touches_html() {
        let mut output: Output = serde_json::from_value(json!({
            "output_type": "display_data",
            "data": {
                "text/html": "http://sparkhead-0/proxy/app",
                "text/plain": "http://sparkhead-0/proxy/app"
            },
            "metadata": {}
        }))
        .unwrap();

        assert!(rewrite_output_links(&mut output, &gateway()));
        let data = output.data().unwrap();
        assert_eq!(
            data["text/html"],
            "https://gw.example.com:30443/gateway/default/yarn/proxy/app"
        );
        assert_eq!(data["text/plain"], "http://sparkhead-0/proxy/app");

        let mut stream = Output::Stream {
            name: "stdout".into(),
            text: "http://sparkhead-0/proxy/app".into(),
        };
        assert!(!rewrite_output_links(&mut stream, &gateway()));
    }

    #[test]
    fn test_rewrite_output_links_in_line_array() {
        let mut output: Output = serde_json::from_value(json!({
            "output_type": "display_data",
            "data": {"text/html": ["<a href=\"http://sparkhead-0/proxy/app\">\n", "Spark UI</a>"]},
            "metadata": {}
        }))
        .unwrap();

        assert!(rewrite_output_links(&mut output, &gateway()));
        assert_eq!(
            output.data().unwrap()["text/html"],
            "<a href=\"https://gw.example.com:30443/gateway/default/yarn/proxy/app\">\nSpark UI</a>"
        );
    }
}
