//! Read-only views: live status, links, baselines, alerts

use anyhow::Result;
use chrono::Utc;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{
    color_backoff, color_mode, color_severity, day_name, format_age, format_percent, format_rate,
    print_json, print_warning, OutputFormat,
};

/// Row for the live status table
#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "Interface")]
    interface: String,
    #[tabled(rename = "Link")]
    link_id: String,
    #[tabled(rename = "Shaping")]
    current: String,
    #[tabled(rename = "Baseline")]
    baseline: String,
    #[tabled(rename = "Last Test")]
    measured: String,
    #[tabled(rename = "Latency")]
    latency: String,
    #[tabled(rename = "Mode")]
    mode: String,
    #[tabled(rename = "Learned")]
    progress: String,
    #[tabled(rename = "Backoff")]
    backoff: String,
    #[tabled(rename = "Applied")]
    applied: String,
}

#[derive(Tabled)]
struct LinkRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Interface")]
    interface: String,
    #[tabled(rename = "Gateway")]
    gateway: String,
    #[tabled(rename = "Profile")]
    profile: String,
    #[tabled(rename = "Nominal")]
    nominal: String,
    #[tabled(rename = "Floor")]
    floor: String,
    #[tabled(rename = "Enabled")]
    enabled: String,
}

#[derive(Tabled)]
struct BucketRow {
    #[tabled(rename = "Day")]
    day: String,
    #[tabled(rename = "Hour")]
    hour: String,
    #[tabled(rename = "Mean")]
    mean: String,
    #[tabled(rename = "Std Dev")]
    std_dev: String,
    #[tabled(rename = "Min")]
    min: String,
    #[tabled(rename = "Max")]
    max: String,
    #[tabled(rename = "Samples")]
    samples: u64,
}

#[derive(Tabled)]
struct AlertRow {
    #[tabled(rename = "Raised")]
    raised: String,
    #[tabled(rename = "Link")]
    link_id: String,
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Message")]
    message: String,
}

fn render<T: Tabled>(rows: Vec<T>) {
    let table = tabled::Table::new(rows)
        .with(tabled::settings::Style::rounded())
        .to_string();
    println!("{}", table);
}

pub async fn show_status(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let status = client.status().await?;

    if let OutputFormat::Json = format {
        return print_json(&status);
    }
    if status.is_empty() {
        print_warning("No WAN links configured");
        return Ok(());
    }

    let now = Utc::now();
    let rows: Vec<StatusRow> = status
        .iter()
        .map(|(interface, s)| StatusRow {
            interface: interface.clone(),
            link_id: s.link_id.clone(),
            current: format_rate(s.current_rate),
            baseline: format_rate(s.baseline_rate),
            measured: format_rate(s.last_speedtest.as_ref().map(|t| t.measured)),
            latency: s
                .last_ping
                .as_ref()
                .map(|p| format!("{:.1} ms ±{:.1}", p.latency, p.jitter))
                .unwrap_or_else(|| "-".to_string()),
            mode: color_mode(&s.mode),
            progress: format_percent(s.learning_progress),
            backoff: color_backoff(s.backoff_active),
            applied: format_age(s.last_applied_at, now),
        })
        .collect();
    render(rows);

    let alerting: usize = status.values().map(|s| s.alerts.len()).sum();
    if alerting > 0 {
        print_warning(&format!(
            "{} recent alert(s); run `sqmctl alerts` for details",
            alerting
        ));
    }
    Ok(())
}

pub async fn show_links(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let links = client.links().await?;

    if let OutputFormat::Json = format {
        return print_json(&links);
    }
    if links.is_empty() {
        print_warning("No WAN links configured");
        return Ok(());
    }

    let rows: Vec<LinkRow> = links
        .iter()
        .map(|l| LinkRow {
            id: l.id.clone(),
            interface: l.interface.clone(),
            gateway: l.gateway_host.clone(),
            profile: l.profile.clone(),
            nominal: format!("{:.0}/{:.0} Mbps", l.nominal_down_mbps, l.nominal_up_mbps),
            floor: format!("{:.0}/{:.0} Mbps", l.floor_down_mbps, l.floor_up_mbps),
            enabled: if l.enabled { "yes" } else { "no" }.to_string(),
        })
        .collect();
    render(rows);
    Ok(())
}

pub async fn show_baseline(
    client: &ApiClient,
    link_id: &str,
    direction: &str,
    format: OutputFormat,
) -> Result<()> {
    let baseline = client.baseline(link_id, direction).await?;

    if let OutputFormat::Json = format {
        return print_json(&baseline);
    }

    println!(
        "{} {} baseline, {} ({} of the week learned)\n",
        baseline.link_id,
        baseline.direction,
        color_mode(&baseline.mode),
        format_percent(baseline.learning_progress)
    );
    if baseline.buckets.is_empty() {
        print_warning("No samples recorded yet");
        return Ok(());
    }

    let rows: Vec<BucketRow> = baseline
        .buckets
        .iter()
        .map(|b| BucketRow {
            day: day_name(b.day_of_week).to_string(),
            hour: format!("{:02}:00", b.hour_of_day),
            mean: format!("{:.1}", b.mean),
            std_dev: b
                .std_dev
                .map(|s| format!("{:.1}", s))
                .unwrap_or_else(|| "-".to_string()),
            min: format!("{:.1}", b.min),
            max: format!("{:.1}", b.max),
            samples: b.sample_count,
        })
        .collect();
    render(rows);
    Ok(())
}

pub async fn show_alerts(client: &ApiClient, limit: usize, format: OutputFormat) -> Result<()> {
    let alerts = client.alerts(limit).await?;

    if let OutputFormat::Json = format {
        return print_json(&alerts);
    }
    if alerts.is_empty() {
        print_warning("No alerts");
        return Ok(());
    }

    let now = Utc::now();
    let rows: Vec<AlertRow> = alerts
        .iter()
        .map(|a| AlertRow {
            raised: format_age(Some(a.raised_at), now),
            link_id: a.link_id.clone(),
            severity: color_severity(&a.severity),
            kind: a.kind.clone(),
            message: a.message.clone(),
        })
        .collect();
    render(rows);
    Ok(())
}
