// Output formatting and display for CLI

use crate::config::FleetConfig;
use crate::health::HealthState;
use crate::instance::{Instance, InstanceStatus};
use chrono::{DateTime, Local, Utc};
use colored::*;
use std::time::Duration;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

/// Print an error message to stderr
pub fn print_error(error: &str) {
    eprintln!("{} {}", "✗ Error:".red().bold(), error);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a success message
pub fn print_success_msg(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print a formatted table of instances
pub fn print_instance_table(instances: &[Instance]) {
    if instances.is_empty() {
        println!("{}", "No instances".yellow());
        return;
    }

    #[derive(Tabled)]
    struct InstanceRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Status")]
        status: String,
        #[tabled(rename = "Health")]
        health: String,
        #[tabled(rename = "PID")]
        pid: String,
        #[tabled(rename = "Gen")]
        generation: String,
        #[tabled(rename = "Uptime")]
        uptime: String,
        #[tabled(rename = "Memory")]
        memory: String,
        #[tabled(rename = "Checks")]
        checks: String,
        #[tabled(rename = "Recoveries")]
        recoveries: String,
        #[tabled(rename = "Workspace")]
        workspace: String,
    }

    let now = Utc::now();
    let rows: Vec<InstanceRow> = instances
        .iter()
        .map(|i| InstanceRow {
            id: truncate(&i.id, 24),
            status: format_status_colored(i.status),
            health: format_health_colored(i.health_state),
            pid: i
                .pid()
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            generation: i.generation.to_string(),
            uptime: i
                .process_ref
                .as_ref()
                .map(|p| format_duration(&since(p.started_at, now)))
                .unwrap_or_else(|| "-".to_string()),
            memory: i
                .last_health
                .as_ref()
                .and_then(|h| h.memory_bytes)
                .map(format_memory)
                .unwrap_or_else(|| "-".to_string()),
            checks: format!("{}/{}", i.healthy_check_count, i.health_check_count),
            recoveries: i.recovery_attempt_count.to_string(),
            workspace: truncate(&i.workspace_path.to_string_lossy(), 40),
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));

    println!("\n{}\n", table);
    println!(
        "{}",
        format!("Total: {} instance(s)", instances.len())
            .dimmed()
            .italic()
    );

    for instance in instances.iter().filter(|i| i.last_error.is_some()) {
        if let Some(error) = &instance.last_error {
            let at: DateTime<Local> = instance.last_activity_at.into();
            println!(
                "  {} {} {}",
                format!("[{}]", at.format("%Y-%m-%d %H:%M:%S")).dimmed(),
                instance.id.bold(),
                error.red()
            );
        }
    }
}

/// Print what a configuration file would run
pub fn print_config_summary(config: &FleetConfig) {
    println!("\n{}", "Policy".bold().underline());
    println!();
    println!(
        "  {:<18} every {}, timeout {}",
        "Health checks:".bold(),
        format_duration(&config.health.interval()),
        format_duration(&config.health.check_timeout())
    );
    println!(
        "  {:<18} degraded after {}, unhealthy after {}, stable after {}",
        "Thresholds:".bold(),
        config.health.degraded_after,
        config.health.unhealthy_after,
        config.health.stable_after
    );
    println!(
        "  {:<18} {} attempt(s), backoff {} up to {}",
        "Recovery:".bold(),
        config.recovery.max_attempts,
        format_duration(&config.recovery.base_delay()),
        format_duration(&config.recovery.max_delay())
    );
    if let Some(state_file) = &config.state_file {
        println!("  {:<18} {}", "State file:".bold(), state_file.display());
    }
    if let Some(root) = &config.workspace_root {
        println!("  {:<18} {}", "Workspace root:".bold(), root.display());
    }

    if config.instances.is_empty() {
        println!("\n{}", "No instances configured".yellow());
        return;
    }

    #[derive(Tabled)]
    struct ConfigRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Command")]
        command: String,
        #[tabled(rename = "Workspace")]
        workspace: String,
        #[tabled(rename = "Env")]
        env: String,
    }

    let rows: Vec<ConfigRow> = config
        .instances
        .iter()
        .map(|i| ConfigRow {
            id: i.id.clone(),
            command: truncate(&i.command, 40),
            workspace: match (&i.workspace, &i.branch) {
                (Some(path), _) => truncate(&path.to_string_lossy(), 40),
                (None, Some(branch)) => format!("<root>/{}-{}", i.id, branch),
                (None, None) => format!("<root>/{}", i.id),
            },
            env: i.env.len().to_string(),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("\n{}\n", table);
}

fn since(start: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - start).to_std().unwrap_or(Duration::from_secs(0))
}

/// Format an instance status with color coding
fn format_status_colored(status: InstanceStatus) -> String {
    match status {
        InstanceStatus::Running => status.to_string().green().to_string(),
        InstanceStatus::Starting => status.to_string().yellow().to_string(),
        InstanceStatus::Stopping => status.to_string().yellow().to_string(),
        InstanceStatus::Stopped => status.to_string().bright_black().to_string(),
        InstanceStatus::Crashed => status.to_string().red().to_string(),
        InstanceStatus::Error => status.to_string().red().bold().to_string(),
        InstanceStatus::Failed => status.to_string().red().bold().to_string(),
    }
}

fn format_health_colored(health: HealthState) -> String {
    match health {
        HealthState::Healthy => health.to_string().green().to_string(),
        HealthState::Degraded => health.to_string().yellow().to_string(),
        HealthState::Unhealthy => health.to_string().red().to_string(),
    }
}

/// Format a duration in human-readable format
fn format_duration(duration: &Duration) -> String {
    let secs = duration.as_secs();

    if secs == 0 && duration.subsec_millis() > 0 {
        format!("{}ms", duration.subsec_millis())
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        let mins = secs / 60;
        let secs = secs % 60;
        if secs > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}m", mins)
        }
    } else if secs < 86400 {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        if mins > 0 {
            format!("{}h {}m", hours, mins)
        } else {
            format!("{}h", hours)
        }
    } else {
        let days = secs / 86400;
        let hours = (secs % 86400) / 3600;
        if hours > 0 {
            format!("{}d {}h", days, hours)
        } else {
            format!("{}d", days)
        }
    }
}

/// Format memory usage in human-readable format
fn format_memory(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes < KB {
        format!("{}B", bytes)
    } else if bytes < MB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    }
}

/// Truncate a string to a maximum number of characters
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(&Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(&Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(&Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(&Duration::from_secs(3700)), "1h 1m");
        assert_eq!(format_duration(&Duration::from_secs(90000)), "1d 1h");
    }

    #[test]
    fn test_format_memory() {
        assert_eq!(format_memory(512), "512B");
        assert_eq!(format_memory(2048), "2.0KB");
        assert_eq!(format_memory(2 * 1024 * 1024), "2.0MB");
        assert_eq!(format_memory(3 * 1024 * 1024 * 1024), "3.00GB");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a very long string", 10), "this is...");
        assert_eq!(truncate("ééééééééééééé", 5), "éé...");
    }

    #[test]
    fn test_since_clamps_future_start() {
        let now = Utc::now();
        assert_eq!(since(now + chrono::Duration::seconds(5), now), Duration::from_secs(0));
    }
}
