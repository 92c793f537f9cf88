/// HTTP client construction
///
/// One client per engine instance: reqwest pools connections per host
/// under the hood, so every download against the same mirror shares a
/// socket pool. Redirects are capped and re-validated against the host
/// allow-list by a custom policy.
use crate::config::EngineConfig;
use crate::core::error::EngineError;

/// Build the engine-wide client from configuration
pub fn create_client(config: &EngineConfig) -> Result<reqwest::Client, EngineError> {
    let allowlist = config.host_allowlist.clone();
    let max_redirects = config.max_redirects;

    let redirect_policy = reqwest::redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() > max_redirects {
            return attempt.error("too many redirects");
        }
        let host_ok = attempt
            .url()
            .host_str()
            .map(|host| {
                allowlist.is_empty() || allowlist.iter().any(|h| h.eq_ignore_ascii_case(host))
            })
            .unwrap_or(false);
        if host_ok {
            attempt.follow()
        } else {
            attempt.stop()
        }
    });

    reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .connect_timeout(config.connect_timeout())
        .read_timeout(config.idle_timeout())
        .redirect(redirect_policy)
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .tcp_keepalive(Some(std::time::Duration::from_secs(60)))
        .build()
        .map_err(EngineError::from)
}
