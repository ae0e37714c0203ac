//! Scope policy over captured hosts
//!
//! Patterns are exact host strings or `*.suffix` wildcards; a wildcard also
//! matches the bare suffix. Out-of-scope patterns take precedence.

use crate::models::ProxyConfig;

/// Strip a trailing `:port` (and IPv6 brackets) from an authority string
pub fn host_without_port(host: &str) -> &str {
  if let Some(stripped) = host.strip_prefix('[') {
    return stripped.split(']').next().unwrap_or(stripped);
  }
  match host.rsplit_once(':') {
    // a second colon in the name part means a bare IPv6 literal, not a port
    Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => name,
    _ => host,
  }
}

/// Check whether a host matches a single scope pattern
pub fn matches_pattern(host: &str, pattern: &str) -> bool {
  if pattern == host {
    return true;
  }
  if let Some(suffix) = pattern.strip_prefix("*.") {
    return host == suffix || host.ends_with(&format!(".{}", suffix));
  }
  false
}

/// Decide whether an exchange for `host` should be saved under `config`
pub fn should_save(config: &ProxyConfig, host: &str) -> bool {
  if !config.save_only_in_scope {
    return true;
  }

  let host = host_without_port(host);

  // exclusions take precedence
  if config
    .out_of_scope
    .iter()
    .any(|pattern| matches_pattern(host, pattern))
  {
    return false;
  }

  config
    .in_scope
    .iter()
    .any(|pattern| matches_pattern(host, pattern))
}
