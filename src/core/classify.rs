use http::StatusCode;
use serde::Serialize;

/// Lowercase body markers that identify a bot-challenge interstitial.
pub const CHALLENGE_MARKERS: [&str; 3] = ["cloudflare", "captcha", "turnstile"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Success,
    Challenge,
    Block,
    Error,
}

impl Classification {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Challenge => "challenge",
            Self::Block => "block",
            Self::Error => "error",
        }
    }

    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

pub fn classify(status: StatusCode, body: &[u8]) -> Classification {
    if status.is_success() {
        return Classification::Success;
    }
    if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
        if contains_challenge_marker(body) {
            return Classification::Challenge;
        }
        return Classification::Block;
    }
    Classification::Error
}

fn contains_challenge_marker(body: &[u8]) -> bool {
    let lowered = body.to_ascii_lowercase();
    CHALLENGE_MARKERS.iter().any(|marker| {
        lowered
            .windows(marker.len())
            .any(|window| window == marker.as_bytes())
    })
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AnomalyReport {
    pub is_anomaly: bool,
    pub reason: Option<String>,
}

pub fn detect_anomaly(status: StatusCode) -> AnomalyReport {
    if status.as_u16() >= 400 {
        return AnomalyReport {
            is_anomaly: true,
            reason: Some(format!("High error status: {}", status.as_u16())),
        };
    }
    AnomalyReport {
        is_anomaly: false,
        reason: None,
    }
}

#[cfg(test)]
mod tests {
    use http::StatusCode;

    use super::{Classification, classify, detect_anomaly};

    fn status(code: u16) -> StatusCode {
        StatusCode::from_u16(code).expect("valid status code")
    }

    #[test]
    fn two_hundreds_are_success_regardless_of_body() {
        assert_eq!(classify(status(200), b"captcha"), Classification::Success);
        assert_eq!(classify(status(204), b""), Classification::Success);
        assert_eq!(classify(status(299), b"anything"), Classification::Success);
    }

    #[test]
    fn challenge_markers_are_case_insensitive() {
        assert_eq!(
            classify(status(403), b"Cloudflare challenge"),
            Classification::Challenge
        );
        assert_eq!(
            classify(status(429), b"<div>Please solve the CAPTCHA</div>"),
            Classification::Challenge
        );
        assert_eq!(
            classify(status(403), b"turnstile widget"),
            Classification::Challenge
        );
    }

    #[test]
    fn forbidden_and_throttled_without_markers_are_blocks() {
        assert_eq!(
            classify(status(403), b"plain forbidden"),
            Classification::Block
        );
        assert_eq!(classify(status(429), b""), Classification::Block);
    }

    #[test]
    fn other_non_success_statuses_are_errors() {
        assert_eq!(classify(status(500), b"cloudflare"), Classification::Error);
        assert_eq!(classify(status(404), b""), Classification::Error);
        assert_eq!(classify(status(301), b""), Classification::Error);
    }

    #[test]
    fn anomaly_flags_error_statuses() {
        let report = detect_anomaly(status(503));
        assert!(report.is_anomaly);
        assert_eq!(report.reason.as_deref(), Some("High error status: 503"));
        assert!(!detect_anomaly(status(200)).is_anomaly);
    }
}
