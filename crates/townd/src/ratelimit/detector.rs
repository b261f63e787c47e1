//! Scans recent pane output for rate-limit/quota signatures.

const SIGNATURES: &[&str] = &[
    "rate limit",
    "rate-limit",
    "ratelimit",
    "429",
    "quota exceeded",
    "quota_exceeded",
    "too many requests",
    "throttle",
    "throttled",
    "overloaded",
    "capacity exceeded",
    "resource_exhausted",
];

/// True if any of the last `lines` look like a provider rate-limit message.
pub fn looks_rate_limited(lines: &[String]) -> bool {
    lines.iter().any(|line| {
        let lower = line.to_lowercase();
        SIGNATURES.iter().any(|sig| lower.contains(sig))
    })
}

/// Best-effort guess at which provider is complaining, for the event log.
/// Falls back to `"unknown"` when the text gives no hint.
pub fn infer_provider(lines: &[String]) -> String {
    let joined = lines.join(" ").to_lowercase();
    for candidate in ["anthropic", "openai", "google", "azure", "bedrock"] {
        if joined.contains(candidate) {
            return candidate.to_string();
        }
    }
    "unknown".to_string()
}

/// The first line matching a rate-limit signature, kept as a short
/// diagnostic snippet on the persisted rate-limit event record.
pub fn matching_line(lines: &[String]) -> Option<String> {
    lines
        .iter()
        .find(|line| {
            let lower = line.to_lowercase();
            SIGNATURES.iter().any(|sig| lower.contains(sig))
        })
        .cloned()
}
