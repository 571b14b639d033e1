//! services/report_sync/src/report.rs
//!
//! The structured daily report form: header fields, an hourly activity table
//! and free remarks, rendered into the draft's single text field.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// One row of the activity table, e.g. `09:00-10:00 仕込み`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub slot: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportForm {
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub department: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub activities: Vec<ActivityEntry>,
    #[serde(default)]
    pub remarks: String,
}

impl ReportForm {
    /// An empty form with one row per hour from `start_hour` up to `end_hour`.
    pub fn with_hourly_slots(date: NaiveDate, start_hour: u32, end_hour: u32) -> Self {
        let activities = (start_hour..end_hour.min(24))
            .map(|hour| ActivityEntry {
                slot: format!("{:02}:00-{:02}:00", hour, hour + 1),
                description: String::new(),
            })
            .collect();
        Self {
            date: Some(date),
            activities,
            ..Self::default()
        }
    }

    /// The text stored as the draft content.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let date = self
            .date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        // Writing into a String cannot fail.
        let _ = writeln!(out, "日付: {}", date);
        let _ = writeln!(out, "部署名: {}", self.department.trim());
        let _ = writeln!(out, "氏名: {}", self.name.trim());

        if !self.activities.is_empty() {
            out.push_str("\n業務内容:\n");
            for entry in &self.activities {
                let description = entry.description.trim();
                if description.is_empty() {
                    let _ = writeln!(out, "{}", entry.slot);
                } else {
                    let _ = writeln!(out, "{} {}", entry.slot, description);
                }
            }
        }

        out.push_str("\n特記事項:\n");
        out.push_str(self.remarks.trim_end());
        out
    }
}
