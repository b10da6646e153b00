//! One-shot local listener for the identity-provider redirect.
//!
//! The provider sends the browser back to `redirect_uri` with
//! `?code=..&state=..`. For a desktop or CLI session that URI points at
//! loopback, and [`CallbackListener`] answers exactly one such request,
//! shows a short confirmation page and hands the parameters over.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use url::{Url, form_urlencoded};

use crate::credential::AuthRequest;
use crate::error::{AuthError, Result};

const DONE_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>MedPASS</title></head>
<body style="font-family: sans-serif; text-align: center; margin-top: 20vh">
    <h1>Signed in to MedPASS</h1>
    <p>You can close this tab.</p>
</body>
</html>"#;

const FAILED_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>MedPASS</title></head>
<body style="font-family: sans-serif; text-align: center; margin-top: 20vh">
    <h1>Could not complete sign-in</h1>
    <p>Return to MedPASS and try again.</p>
</body>
</html>"#;

/// Query parameters of a provider redirect.
#[derive(Clone, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: String,
    pub state: String,
}

impl CallbackParams {
    /// Parse the query of a request target such as `/callback?code=..`.
    ///
    /// # Errors
    ///
    /// [`AuthError::CallbackFailed`] if the provider reported an error or a
    /// parameter is missing.
    pub fn from_target(target: &str) -> Result<Self> {
        let Some((_, query)) = target.split_once('?') else {
            return Err(AuthError::CallbackFailed {
                reason: "redirect has no query string".to_string(),
            });
        };

        let mut code = None;
        let mut state = None;
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                "error" => {
                    return Err(AuthError::CallbackFailed {
                        reason: format!("provider returned error: {value}"),
                    });
                }
                _ => {}
            }
        }

        let code = code
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AuthError::CallbackFailed {
                reason: "redirect is missing 'code'".to_string(),
            })?;
        let state = state.ok_or_else(|| AuthError::CallbackFailed {
            reason: "redirect is missing 'state'".to_string(),
        })?;
        Ok(Self { code, state })
    }

    /// The login request carrying these parameters.
    pub fn into_request(self) -> AuthRequest {
        AuthRequest::ProviderCallback {
            code: self.code,
            state: self.state,
        }
    }
}

impl std::fmt::Debug for CallbackParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackParams")
            .field("code", &"<redacted>")
            .field("state", &self.state)
            .finish()
    }
}

/// A bound loopback listener waiting for one redirect.
pub struct CallbackListener {
    listener: TcpListener,
}

impl CallbackListener {
    /// Bind to the host and port of `redirect_uri`.
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidConfig`] if the URI has no host or port,
    /// [`AuthError::Io`] if the port cannot be bound.
    pub async fn for_redirect_uri(redirect_uri: &str) -> Result<Self> {
        let url = Url::parse(redirect_uri)?;
        let host = url.host_str().ok_or_else(|| AuthError::InvalidConfig {
            reason: format!("redirect_uri {redirect_uri:?} has no host"),
        })?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| AuthError::InvalidConfig {
                reason: format!("redirect_uri {redirect_uri:?} has no port"),
            })?;
        Self::bind(&format!("{host}:{port}")).await
    }

    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "waiting for provider redirect");
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait up to `timeout_secs` for the redirect.
    ///
    /// # Errors
    ///
    /// [`AuthError::CallbackTimeout`] when nothing arrives in time, or the
    /// errors of [`CallbackParams::from_target`].
    pub async fn wait(self, timeout_secs: u64) -> Result<CallbackParams> {
        let timeout = std::time::Duration::from_secs(timeout_secs);
        match tokio::time::timeout(timeout, self.accept_one()).await {
            Ok(result) => result,
            Err(_) => Err(AuthError::CallbackTimeout { timeout_secs }),
        }
    }

    async fn accept_one(&self) -> Result<CallbackParams> {
        let (mut stream, peer) = self.listener.accept().await?;
        tracing::debug!(peer = %peer, "redirect connection accepted");

        // A redirect is a single small GET.
        let mut buf = [0u8; 8192];
        let n = stream.read(&mut buf).await?;
        let request = String::from_utf8_lossy(&buf[..n]);

        let params = request_target(&request).and_then(CallbackParams::from_target);

        let (status, body) = match &params {
            Ok(_) => ("200 OK", DONE_HTML),
            Err(_) => ("400 Bad Request", FAILED_HTML),
        };
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(response.as_bytes()).await?;
        stream.flush().await?;

        match &params {
            Ok(_) => tracing::info!("provider redirect received"),
            Err(e) => tracing::warn!(error = %e, "unusable provider redirect"),
        }
        params
    }
}

/// Request target from `GET /callback?.. HTTP/1.1`.
fn request_target(request: &str) -> Result<&str> {
    let line = request.lines().next().unwrap_or_default();
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("GET"), Some(target)) => Ok(target),
        _ => Err(AuthError::CallbackFailed {
            reason: format!("unexpected request line {line:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpStream;

    use super::*;

    #[test]
    fn parses_code_and_state() {
        let params = CallbackParams::from_target("/callback?code=abc123&state=xyz789").unwrap();
        assert_eq!(params.code, "abc123");
        assert_eq!(params.state, "xyz789");
    }

    #[test]
    fn decodes_percent_and_plus() {
        let params =
            CallbackParams::from_target("/cb?code=4%2F0Ad+x&state=s%3D1&scope=email").unwrap();
        assert_eq!(params.code, "4/0Ad x");
        assert_eq!(params.state, "s=1");
    }

    #[test]
    fn provider_error_is_reported() {
        let err = CallbackParams::from_target("/cb?error=access_denied&state=x").unwrap_err();
        assert!(err.to_string().contains("access_denied"));
    }

    #[test]
    fn missing_parameters_are_rejected() {
        let err = CallbackParams::from_target("/cb?state=x").unwrap_err();
        assert!(err.to_string().contains("'code'"));

        let err = CallbackParams::from_target("/cb?code=c").unwrap_err();
        assert!(err.to_string().contains("'state'"));

        assert!(CallbackParams::from_target("/cb").is_err());
    }

    #[test]
    fn request_line_must_be_get() {
        assert_eq!(
            request_target("GET /cb?code=c&state=s HTTP/1.1\r\n\r\n").unwrap(),
            "/cb?code=c&state=s"
        );
        assert!(request_target("POST /cb HTTP/1.1").is_err());
        assert!(request_target("").is_err());
    }

    #[test]
    fn debug_hides_code() {
        let params = CallbackParams {
            code: "secret-code".to_string(),
            state: "s".to_string(),
        };
        assert!(!format!("{params:?}").contains("secret-code"));
        assert!(matches!(
            params.into_request(),
            AuthRequest::ProviderCallback { .. }
        ));
    }

    #[tokio::test]
    async fn listener_answers_one_redirect() {
        let listener = CallbackListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let browser = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"GET /callback?code=c42&state=s99 HTTP/1.1\r\nHost: localhost\r\n\r\n")
                .await
                .unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).await.unwrap();
            response
        });

        let params = listener.wait(5).await.unwrap();
        let response = browser.await.unwrap();

        assert_eq!(params.code, "c42");
        assert_eq!(params.state, "s99");
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("Signed in to MedPASS"));
    }

    #[tokio::test]
    async fn listener_times_out() {
        let listener = CallbackListener::bind("127.0.0.1:0").await.unwrap();
        assert!(matches!(
            listener.wait(1).await,
            Err(AuthError::CallbackTimeout { timeout_secs: 1 })
        ));
    }

    #[tokio::test]
    async fn redirect_uri_without_host_is_invalid() {
        assert!(CallbackListener::for_redirect_uri("not a uri").await.is_err());
        assert!(matches!(
            CallbackListener::for_redirect_uri("unix:/tmp/socket").await,
            Err(AuthError::InvalidConfig { .. })
        ));
    }
}
