//! Manual operations: speed test now, redeploy

use anyhow::Result;

use crate::client::ApiClient;
use crate::output::{format_rate, print_info, print_json, print_success, OutputFormat};

pub async fn run_test(client: &ApiClient, link_id: &str, format: OutputFormat) -> Result<()> {
    let response = client.request_test(link_id).await?;

    match format {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => match response.admission.as_str() {
            "started" => print_success(&format!("Speed test started on {}", link_id)),
            _ => print_info(&format!(
                "A speed test on {} is running or just ran; request merged",
                link_id
            )),
        },
    }
    Ok(())
}

pub async fn redeploy(client: &ApiClient, link_id: &str, format: OutputFormat) -> Result<()> {
    let response = client.redeploy(link_id).await?;

    match format {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => {
            let rate = format_rate(response.state.as_ref().map(|s| s.applied));
            match response.outcome.as_str() {
                "applied" => print_success(&format!("Redeployed {} at {}", link_id, rate)),
                other => print_info(&format!("Redeploy of {}: {}", link_id, other)),
            }
        }
    }
    Ok(())
}
