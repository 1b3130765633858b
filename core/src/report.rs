//! Rollout report persistence and rendering.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::pipeline::RolloutReport;

/// File name of the JSON report inside the state directory.
pub const REPORT_FILE: &str = "report.json";

/// Writes the report as pretty JSON to `<state_dir>/report.json`.
pub fn write_report(state_dir: &Path, report: &RolloutReport) -> Result<PathBuf> {
    std::fs::create_dir_all(state_dir)?;
    let path = state_dir.join(REPORT_FILE);
    let json = serde_json::to_string_pretty(report)
        .map_err(|e| Error::Serialization(format!("failed to serialize report: {}", e)))?;
    std::fs::write(&path, json)?;
    Ok(path)
}

/// Formats a rollout report as markdown.
pub fn render_markdown(report: &RolloutReport) -> String {
    let mut md = String::new();

    md.push_str(&format!("## Rollout: {}\n\n", report.pipeline));
    md.push_str(&format!("**Rollout ID:** `{}`\n\n", report.rollout_id));
    md.push_str(&format!("**Status:** {:?}\n\n", report.status));
    md.push_str(&format!("**Duration:** {:.1}s\n\n", report.duration().as_secs_f64()));
    md.push_str(&format!("**Environments:** {}\n\n", report.environment_count()));
    if let Some(error) = &report.error {
        md.push_str(&format!("**Stopped:** {}\n\n", error));
    }

    for wave in &report.waves {
        md.push_str(&format!("### Wave {} ({:?})\n\n", wave.wave, wave.status));
        md.push_str("| Environment | Version | Status | Attempts | Error |\n");
        md.push_str("|-------------|---------|--------|----------|-------|\n");
        for result in wave.ordered() {
            let error = result
                .error
                .as_deref()
                .or(result.validation.last_error.as_deref())
                .unwrap_or("");
            md.push_str(&format!(
                "| {} | {} | {} | {} | {} |\n",
                result.environment,
                result.version,
                result.status.as_str(),
                result.validation.attempts,
                error.replace('|', "\\|")
            ));
        }
        md.push('\n');
    }

    if let Some(promotion) = &report.promotion {
        let request = &promotion.request;
        md.push_str("### Promotion\n\n");
        md.push_str(&format!(
            "- **Target:** {} ({})\n",
            request.target().name(),
            request.target().version()
        ));
        md.push_str(&format!("- **Request:** `{}`\n", request.id()));
        md.push_str(&format!("- **State:** {}\n", request.state()));
        if request.cutover_attempts() > 0 {
            md.push_str(&format!("- **Cut-over attempts:** {}\n", request.cutover_attempts()));
        }
        if let Some(error) = &promotion.error {
            md.push_str(&format!("- **Error:** {}\n", error));
        }
        md.push('\n');
    }

    if !report.left_running.is_empty() {
        md.push_str("### Left Running\n\n");
        for name in &report.left_running {
            md.push_str(&format!("- {}\n", name));
        }
        md.push('\n');
    }

    md
}
