//! Build report verification.
//!
//! A target passes only when a report exists and every package in it is
//! explicitly marked successful. A missing `success` field counts as failed.

use std::path::Path;

use serde::Serialize;

use crate::domain::{BuildReport, VerificationError};

/// Location of the report relative to the builder's working directory.
pub const REPORT_RELATIVE_PATH: &str = "output_logs/build_report.json";

/// Verdict for one build report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    pub overall_success: bool,
    /// Failed package names, in report order.
    pub failed_packages: Vec<String>,
    pub total_packages: usize,
}

impl VerificationResult {
    pub fn passed_packages(&self) -> usize {
        self.total_packages - self.failed_packages.len()
    }

    /// `"N/M packages successful"`
    pub fn summary(&self) -> String {
        format!(
            "{}/{} packages successful",
            self.passed_packages(),
            self.total_packages
        )
    }
}

/// Evaluate a report. An empty report passes vacuously.
pub fn verify(report: Option<&BuildReport>) -> Result<VerificationResult, VerificationError> {
    let report = report.ok_or(VerificationError::MissingReport)?;

    let failed_packages: Vec<String> = report
        .iter()
        .filter(|(_, result)| !result.passed())
        .map(|(name, _)| name.to_string())
        .collect();

    Ok(VerificationResult {
        overall_success: failed_packages.is_empty(),
        failed_packages,
        total_packages: report.len(),
    })
}

/// Read and parse a report file. An absent file yields `Ok(None)`.
pub fn load_report(path: &Path) -> Result<Option<BuildReport>, VerificationError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(VerificationError::MalformedReport(format!(
                "cannot read {}: {}",
                path.display(),
                e
            )))
        }
    };

    BuildReport::from_json(&text)
        .map(Some)
        .map_err(|e| VerificationError::MalformedReport(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PackageResult;

    #[test]
    fn test_all_passed() {
        let report: BuildReport = vec![
            ("gflags", PackageResult::ok("Built successfully")),
            ("glog", PackageResult::ok("Built successfully")),
        ]
        .into_iter()
        .collect();
        let result = verify(Some(&report)).unwrap();
        assert!(result.overall_success);
        assert!(result.failed_packages.is_empty());
        assert_eq!(result.summary(), "2/2 packages successful");
    }

    #[test]
    fn test_missing_success_counts_as_failed() {
        let mut report = BuildReport::new();
        report.insert("gflags", PackageResult::ok("ok"));
        report.insert(
            "glog",
            PackageResult {
                success: None,
                detail: None,
            },
        );
        let result = verify(Some(&report)).unwrap();
        assert!(!result.overall_success);
        assert_eq!(result.failed_packages, vec!["glog".to_string()]);
        assert_eq!(result.summary(), "1/2 packages successful");
    }

    #[test]
    fn test_absent_report_is_an_error() {
        assert!(matches!(
            verify(None).unwrap_err(),
            VerificationError::MissingReport
        ));
    }

    #[test]
    fn test_empty_report_passes_vacuously() {
        let result = verify(Some(&BuildReport::new())).unwrap();
        assert!(result.overall_success);
        assert_eq!(result.total_packages, 0);
    }

    #[test]
    fn test_load_report_absent_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build_report.json");
        assert!(load_report(&path).unwrap().is_none());

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            load_report(&path).unwrap_err(),
            VerificationError::MalformedReport(_)
        ));

        std::fs::write(&path, r#"{"jsoncpp": {"success": true, "message": "ok"}}"#).unwrap();
        let report = load_report(&path).unwrap().unwrap();
        assert_eq!(report.len(), 1);
    }
}
