/// A validated request, owned by the task handling it.
use crate::config::types::{ExecutionRequest, LimitOverrides, Result, RunnerError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub language: String,
    pub source: String,
    pub stdin: String,
    pub overrides: Option<LimitOverrides>,
}

impl Submission {
    /// Reject malformed requests before anything is allocated.
    pub fn from_request(request: &ExecutionRequest, max_source_bytes: usize) -> Result<Self> {
        let language = request.language.trim();
        if language.is_empty() {
            return Err(RunnerError::InvalidRequest("language is required".to_string()));
        }
        if request.source.trim().is_empty() {
            return Err(RunnerError::InvalidRequest("source is empty".to_string()));
        }
        if request.source.len() > max_source_bytes {
            return Err(RunnerError::InvalidRequest(format!(
                "source is {} bytes, limit is {}",
                request.source.len(),
                max_source_bytes
            )));
        }
        let stdin = request.stdin.clone().unwrap_or_default();
        if stdin.len() > max_source_bytes {
            return Err(RunnerError::InvalidRequest(format!(
                "stdin is {} bytes, limit is {}",
                stdin.len(),
                max_source_bytes
            )));
        }
        Ok(Self {
            language: language.to_string(),
            source: request.source.clone(),
            stdin,
            overrides: request.limits.clone().filter(|l| !l.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(language: &str, source: &str) -> ExecutionRequest {
        ExecutionRequest {
            language: language.to_string(),
            source: source.to_string(),
            stdin: None,
            limits: None,
        }
    }

    #[test]
    fn test_valid_request() {
        let submission = Submission::from_request(&request(" python ", "print(1)"), 1024).unwrap();
        assert_eq!(submission.language, "python");
        assert_eq!(submission.stdin, "");
        assert!(submission.overrides.is_none());
    }

    #[test]
    fn test_malformed_requests_rejected() {
        assert!(Submission::from_request(&request("", "x"), 1024).is_err());
        assert!(Submission::from_request(&request("python", "  \n"), 1024).is_err());
        let err = Submission::from_request(&request("python", &"x".repeat(2048)), 1024).unwrap_err();
        assert!(err.is_caller_error());
    }

    #[test]
    fn test_empty_overrides_dropped() {
        let mut req = request("python", "print(1)");
        req.limits = Some(LimitOverrides::default());
        let submission = Submission::from_request(&req, 1024).unwrap();
        assert!(submission.overrides.is_none());
    }
}
