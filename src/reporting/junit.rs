//! # Exportador JUnit
//!
//! Converte o desfecho por SN em um `junit.xml` consumível por CI
//! (um testcase por SN, failure com o detalhe das falhas de step).

use anyhow::Result;
use quick_junit::{NonSuccessKind, Report, TestCase, TestCaseStatus, TestSuite};
use std::fs::File;
use std::path::Path;

use crate::runner::RunSummary;

pub fn write_junit(path: &Path, summary: &RunSummary) -> Result<()> {
    let mut report = Report::new("mtap_batch");
    let mut suite = TestSuite::new(summary.batch_id.clone());

    for (sn, sn_summary) in &summary.per_sn {
        let status = if sn_summary.passed {
            TestCaseStatus::success()
        } else {
            let mut status = TestCaseStatus::non_success(NonSuccessKind::Failure);
            let detail = sn_summary
                .failures
                .iter()
                .map(|f| {
                    format!(
                        "{} ({}): {}",
                        f.step_id,
                        f.error_code.as_deref().unwrap_or("UNKNOWN"),
                        f.message
                    )
                })
                .collect::<Vec<_>>()
                .join("; ");
            status.set_message(detail);
            status
        };
        let mut case = TestCase::new(sn.clone(), status);
        case.set_classname("mtap");
        suite.add_test_case(case);
    }

    report.add_test_suite(suite);
    let file = File::create(path)?;
    report.serialize(file)?;
    Ok(())
}
