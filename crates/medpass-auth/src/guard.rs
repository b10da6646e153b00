//! Route guard for protected dashboard pages.
//!
//! Given a requested path and the current [`SessionStatus`], the guard
//! decides whether to let the navigation through, send the caller to the
//! sign-in page (remembering where they were going), or bounce an already
//! signed-in user away from the sign-in page.

use serde::{Deserialize, Serialize};
use url::form_urlencoded;

use crate::credential::SessionStatus;

/// Which paths are protected and where redirects go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Prefixes that require an authenticated session.
    pub protected_prefixes: Vec<String>,
    /// Entry pages that make no sense once signed in.
    pub auth_pages: Vec<String>,
    pub login_path: String,
    pub home_path: String,
    /// Query parameter carrying the return path on the login redirect.
    pub return_param: String,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            protected_prefixes: [
                "/dashboard",
                "/analytics",
                "/calendar",
                "/settings",
                "/chat",
                "/review",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            auth_pages: vec!["/auth/login".to_string(), "/auth/register".to_string()],
            login_path: "/auth/login".to_string(),
            home_path: "/dashboard".to_string(),
            return_param: "returnTo".to_string(),
        }
    }
}

/// Outcome of a navigation check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Admit,
    /// Send the caller to sign in, then back to `return_path`.
    RedirectToLogin { return_path: String },
    RedirectToHome,
}

/// Decides navigation outcomes from a [`GuardConfig`].
#[derive(Debug, Clone, Default)]
pub struct RouteGuard {
    config: GuardConfig,
}

impl RouteGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Decide what happens when `path` is requested under `status`.
    ///
    /// `path` may carry a query string or fragment; matching ignores them
    /// but the login redirect preserves the full path.
    pub fn decide(&self, path: &str, status: SessionStatus) -> GuardDecision {
        let route = route_of(path);
        let authenticated = status.is_authenticated();

        if !authenticated && self.is_protected(route) {
            tracing::debug!(path = path, status = %status, "protected route, redirecting to login");
            return GuardDecision::RedirectToLogin {
                return_path: path.to_string(),
            };
        }

        if authenticated && self.is_auth_page(route) {
            tracing::debug!(path = path, "already signed in, redirecting home");
            return GuardDecision::RedirectToHome;
        }

        GuardDecision::Admit
    }

    /// Whether `path` falls under a protected prefix.
    pub fn is_protected(&self, path: &str) -> bool {
        let route = route_of(path);
        self.config
            .protected_prefixes
            .iter()
            .any(|prefix| matches_prefix(route, prefix))
    }

    fn is_auth_page(&self, route: &str) -> bool {
        self.config
            .auth_pages
            .iter()
            .any(|page| route.trim_end_matches('/') == page.trim_end_matches('/'))
    }

    /// Redirect target for a decision, `None` for [`GuardDecision::Admit`].
    pub fn location(&self, decision: &GuardDecision) -> Option<String> {
        match decision {
            GuardDecision::Admit => None,
            GuardDecision::RedirectToHome => Some(self.config.home_path.clone()),
            GuardDecision::RedirectToLogin { return_path } => {
                let query = form_urlencoded::Serializer::new(String::new())
                    .append_pair(&self.config.return_param, return_path)
                    .finish();
                Some(format!("{}?{}", self.config.login_path, query))
            }
        }
    }
}

/// Strip query string and fragment.
fn route_of(path: &str) -> &str {
    let end = path.find(['?', '#']).unwrap_or(path.len());
    &path[..end]
}

/// `/dashboard` matches `/dashboard`, `/dashboard/` and `/dashboard/x`, but
/// not `/dashboards`.
fn matches_prefix(route: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match route.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> RouteGuard {
        RouteGuard::new(GuardConfig::default())
    }

    #[test]
    fn unauthenticated_protected_path_redirects_to_login() {
        let decision = guard().decide("/dashboard/settings", SessionStatus::Unauthenticated);
        assert_eq!(
            decision,
            GuardDecision::RedirectToLogin {
                return_path: "/dashboard/settings".to_string()
            }
        );
    }

    #[test]
    fn authenticated_login_page_redirects_home() {
        let decision = guard().decide("/auth/login", SessionStatus::Authenticated);
        assert_eq!(decision, GuardDecision::RedirectToHome);
    }

    #[test]
    fn authenticated_protected_path_is_admitted() {
        assert_eq!(
            guard().decide("/analytics", SessionStatus::Authenticated),
            GuardDecision::Admit
        );
    }

    #[test]
    fn public_path_is_admitted_for_everyone() {
        for status in [
            SessionStatus::Unauthenticated,
            SessionStatus::Authenticating,
            SessionStatus::Authenticated,
        ] {
            assert_eq!(guard().decide("/about", status), GuardDecision::Admit);
        }
    }

    #[test]
    fn login_page_admitted_when_signed_out() {
        assert_eq!(
            guard().decide("/auth/login", SessionStatus::Unauthenticated),
            GuardDecision::Admit
        );
    }

    #[test]
    fn in_flight_and_failed_sessions_are_not_authenticated() {
        for status in [SessionStatus::Authenticating, SessionStatus::RefreshFailed] {
            assert!(matches!(
                guard().decide("/review", status),
                GuardDecision::RedirectToLogin { .. }
            ));
        }
    }

    #[test]
    fn prefix_matches_on_segment_boundary() {
        let g = guard();
        assert!(g.is_protected("/dashboard"));
        assert!(g.is_protected("/dashboard/"));
        assert!(g.is_protected("/dashboard/exams/12"));
        assert!(!g.is_protected("/dashboards"));
        assert!(!g.is_protected("/"));
    }

    #[test]
    fn query_is_ignored_for_matching_but_kept_in_return_path() {
        let decision = guard().decide("/calendar?week=3#today", SessionStatus::Unauthenticated);
        assert_eq!(
            decision,
            GuardDecision::RedirectToLogin {
                return_path: "/calendar?week=3#today".to_string()
            }
        );
        assert_eq!(
            guard().decide("/auth/login?next=x", SessionStatus::Authenticated),
            GuardDecision::RedirectToHome
        );
    }

    #[test]
    fn custom_prefixes_replace_defaults() {
        let g = RouteGuard::new(GuardConfig {
            protected_prefixes: vec!["/admin/".to_string()],
            ..GuardConfig::default()
        });
        assert!(g.is_protected("/admin/users"));
        assert!(!g.is_protected("/dashboard"));
    }

    #[test]
    fn location_encodes_return_path() {
        let g = guard();
        let decision = GuardDecision::RedirectToLogin {
            return_path: "/calendar?week=3".to_string(),
        };
        assert_eq!(
            g.location(&decision).unwrap(),
            "/auth/login?returnTo=%2Fcalendar%3Fweek%3D3"
        );
        assert_eq!(
            g.location(&GuardDecision::RedirectToHome).as_deref(),
            Some("/dashboard")
        );
        assert!(g.location(&GuardDecision::Admit).is_none());
    }
}
