//! Request classification and the serving decision.
//!
//! Classification looks only at the request itself (headers, path,
//! user-agent); the decision combines it with the host's effective
//! strategy. Internal loopback requests and anything carrying the gateway's
//! own user-agent must never be rendered again, or the render engine would
//! feed itself.

use crate::config::Strategy;
use std::path::Path;

/// Header set by the render engine on every loopback request.
pub const INTERNAL_HEADER: &str = "x-renderx-internal";

/// User-agent the headless browser presents on loopback requests.
pub const RENDER_USER_AGENT: &str = "RenderX/1.0";

/// Facts derived from a single request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestClass {
    /// Carries `X-RenderX-Internal: true`.
    pub is_internal: bool,
    /// User-agent contains `renderx`.
    pub is_renderx: bool,
    /// Path has a non-empty file extension.
    pub is_file: bool,
    /// User-agent contains one of the configured bot substrings.
    pub is_bot: bool,
}

impl RequestClass {
    /// Requests that must never trigger a render.
    pub fn never_render(&self) -> bool {
        self.is_internal || self.is_renderx || self.is_file
    }
}

/// How the router should answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeMode {
    Static,
    Render,
}

pub fn classify(
    internal_header: Option<&str>,
    user_agent: &str,
    path: &str,
    bots: &[String],
) -> RequestClass {
    let ua_lower = user_agent.to_lowercase();
    RequestClass {
        is_internal: internal_header.is_some_and(|v| v.eq_ignore_ascii_case("true")),
        is_renderx: ua_lower.contains("renderx"),
        is_file: is_file_request(path),
        is_bot: bots
            .iter()
            .any(|bot| ua_lower.contains(&bot.to_lowercase())),
    }
}

/// A path is a file request when its last segment has a non-empty
/// extension.
pub fn is_file_request(path: &str) -> bool {
    Path::new(path)
        .extension()
        .is_some_and(|ext| !ext.is_empty())
}

/// The serving decision table. Internal, self-issued and file requests are
/// always static regardless of strategy.
pub fn decide(strategy: Strategy, class: &RequestClass) -> ServeMode {
    if class.never_render() {
        return ServeMode::Static;
    }
    match strategy {
        Strategy::Csr => ServeMode::Static,
        Strategy::Ssr => ServeMode::Render,
        Strategy::SmartSsr => {
            if class.is_bot {
                ServeMode::Render
            } else {
                ServeMode::Static
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_BOTS;

    fn bots() -> Vec<String> {
        DEFAULT_BOTS.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn googlebot_is_a_bot() {
        let class = classify(
            None,
            "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)",
            "/",
            &bots(),
        );
        assert!(class.is_bot);
        assert!(!class.is_internal);
        assert!(!class.is_renderx);
        assert!(!class.is_file);
    }

    #[test]
    fn bot_matching_is_case_insensitive() {
        let class = classify(None, "GOOGLEBOT/2.1", "/", &bots());
        assert!(class.is_bot);
    }

    #[test]
    fn chrome_user_is_not_a_bot() {
        let class = classify(
            None,
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 Chrome/120.0 Safari/537.36",
            "/",
            &bots(),
        );
        assert!(!class.is_bot);
    }

    #[test]
    fn internal_and_renderx_markers_are_detected() {
        let class = classify(Some("true"), "RenderX/1.0", "/", &bots());
        assert!(class.is_internal);
        assert!(class.is_renderx);
        assert!(class.never_render());

        let class = classify(Some("false"), "Mozilla/5.0", "/", &bots());
        assert!(!class.is_internal);
    }

    #[test]
    fn file_requests_are_detected_by_extension() {
        assert!(is_file_request("/static/js/main.9f2c.js"));
        assert!(is_file_request("/favicon.ico"));
        assert!(!is_file_request("/"));
        assert!(!is_file_request("/about"));
        assert!(!is_file_request("/products/42"));
    }

    #[test]
    fn decision_table_matches_strategy_semantics() {
        let user = RequestClass::default();
        let bot = RequestClass {
            is_bot: true,
            ..Default::default()
        };
        let internal = RequestClass {
            is_internal: true,
            is_bot: true,
            ..Default::default()
        };
        let file = RequestClass {
            is_file: true,
            is_bot: true,
            ..Default::default()
        };

        // csr: nobody gets a render.
        assert_eq!(decide(Strategy::Csr, &user), ServeMode::Static);
        assert_eq!(decide(Strategy::Csr, &bot), ServeMode::Static);

        // ssr: everyone external gets a render.
        assert_eq!(decide(Strategy::Ssr, &user), ServeMode::Render);
        assert_eq!(decide(Strategy::Ssr, &bot), ServeMode::Render);

        // smart-ssr: bots only.
        assert_eq!(decide(Strategy::SmartSsr, &user), ServeMode::Static);
        assert_eq!(decide(Strategy::SmartSsr, &bot), ServeMode::Render);

        // Loop safety beats every strategy.
        for strategy in [Strategy::Csr, Strategy::Ssr, Strategy::SmartSsr] {
            assert_eq!(decide(strategy, &internal), ServeMode::Static);
            assert_eq!(decide(strategy, &file), ServeMode::Static);
        }
    }
}
