//! Table and text formatting helpers for CLI output.

use chrono::{DateTime, Utc};
use comfy_table::{ContentArrangement, Table};
use dockling_runtime::{ContainerState, ContainerSummary, ImageReference};

/// Create a styled table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Human-readable length of the interval between `dt` and `now`.
pub fn format_elapsed(dt: &DateTime<Utc>, now: &DateTime<Utc>) -> String {
    let duration = now.signed_duration_since(*dt);

    let secs = duration.num_seconds().max(0);
    if secs < 60 {
        return format!("{secs} seconds");
    }

    let mins = duration.num_minutes();
    if mins < 60 {
        return format!("{mins} minutes");
    }

    let hours = duration.num_hours();
    if hours < 24 {
        return format!("{hours} hours");
    }

    let days = duration.num_days();
    if days < 30 {
        return format!("{days} days");
    }

    let months = days / 30;
    if months < 12 {
        return format!("{months} months");
    }

    format!("{} years", days / 365)
}

/// Format a chrono timestamp as a relative "ago" string.
pub fn format_ago(dt: &DateTime<Utc>) -> String {
    let now = Utc::now();
    if now < *dt {
        return "just now".to_string();
    }
    format!("{} ago", format_elapsed(dt, &now))
}

/// `ps` status column: "Up 5 minutes", "Exited (0) 2 hours ago", "Created".
pub fn format_status(summary: &ContainerSummary) -> String {
    match summary.state {
        ContainerState::Running => match &summary.started_at {
            Some(started) => format!("Up {}", format_elapsed(started, &Utc::now())),
            None => "Up".to_string(),
        },
        ContainerState::Stopped => {
            let code = summary
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "?".to_string());
            match &summary.finished_at {
                Some(finished) => format!("Exited ({code}) {}", format_ago(finished)),
                None => format!("Exited ({code})"),
            }
        }
        ContainerState::Created => "Created".to_string(),
        ContainerState::Removed => "Removed".to_string(),
    }
}

/// Quote and shorten a command line for table display.
pub fn truncate_command(command: &str, max: usize) -> String {
    if command.chars().count() <= max {
        return format!("\"{command}\"");
    }
    let head: String = command.chars().take(max.saturating_sub(1)).collect();
    format!("\"{head}…\"")
}

/// Split a stored tag into the `REPOSITORY` and `TAG` columns.
pub fn split_tag(tag: &str) -> (String, String) {
    match ImageReference::parse(tag) {
        Ok(reference) => {
            let familiar = reference.familiar();
            match &reference.tag {
                Some(t) => {
                    let repo = familiar
                        .strip_suffix(&format!(":{t}"))
                        .unwrap_or(&familiar)
                        .to_string();
                    (repo, t.clone())
                }
                None => (familiar, "<none>".to_string()),
            }
        }
        Err(_) => (tag.to_string(), "<none>".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(1048576 + 524288), "1.5 MB");
        assert_eq!(format_bytes(10 * 1073741824), "10.0 GB");
    }

    #[test]
    fn test_format_elapsed_units() {
        let now = Utc::now();
        assert_eq!(format_elapsed(&(now - Duration::seconds(5)), &now), "5 seconds");
        assert_eq!(format_elapsed(&(now - Duration::minutes(3)), &now), "3 minutes");
        assert_eq!(format_elapsed(&(now - Duration::hours(2)), &now), "2 hours");
        assert_eq!(format_elapsed(&(now - Duration::days(4)), &now), "4 days");
        assert_eq!(format_elapsed(&(now - Duration::days(400)), &now), "1 years");
    }

    #[test]
    fn test_format_ago_future_is_just_now() {
        assert_eq!(format_ago(&(Utc::now() + Duration::hours(1))), "just now");
    }

    #[test]
    fn test_truncate_command() {
        assert_eq!(truncate_command("sleep 30", 20), "\"sleep 30\"");
        assert_eq!(truncate_command("abcdefghij", 5), "\"abcd…\"");
    }

    #[test]
    fn test_split_tag() {
        assert_eq!(
            split_tag("docker.io/library/nginx:1.25"),
            ("nginx".to_string(), "1.25".to_string())
        );
        assert_eq!(
            split_tag("localhost:5000/team/app:1"),
            ("localhost:5000/team/app".to_string(), "1".to_string())
        );
    }
}
