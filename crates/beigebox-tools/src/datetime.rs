use async_trait::async_trait;

use crate::Tool;

/// Current date and time in UTC.
pub struct DateTimeTool;

#[async_trait]
impl Tool for DateTimeTool {
    fn name(&self) -> &str {
        "datetime"
    }

    fn description(&self) -> &str {
        "Current date and time (UTC)"
    }

    async fn run(&self, _input: &str) -> String {
        let now = chrono::Utc::now();
        format!(
            "Current UTC time: {}\nDate: {}\nDay of week: {}",
            now.format("%H:%M:%S"),
            now.format("%Y-%m-%d"),
            now.format("%A"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_a_date_line() {
        let out = DateTimeTool.run("").await;
        assert!(out.contains("Current UTC time:"));
        assert!(out.contains("Day of week:"));
    }
}
