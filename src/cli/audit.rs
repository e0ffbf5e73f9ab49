use crate::audit::AuditQuery;
use crate::types::{AuditAction, AuditLogEntry};

use super::open_client;

fn print_entries(entries: &[AuditLogEntry]) {
    if entries.is_empty() {
        println!("No audit entries found.");
        return;
    }
    println!();
    for entry in entries {
        let scope = entry.scope_key();
        let target = entry.entity_name.as_deref().unwrap_or("-");
        println!(
            "  {}  {:<17} {:<20} {:<24} {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.action.as_str(),
            entry.principal_name,
            scope,
            target
        );
    }
    println!();
}

pub fn run_audit_list(
    data_dir: String,
    city: Option<String>,
    institution: Option<String>,
    principal_id: Option<String>,
    action: Option<String>,
    limit: usize,
    json: bool,
) -> anyhow::Result<()> {
    let action = match action {
        Some(name) => match AuditAction::parse(&name) {
            Some(action) => Some(action),
            None => anyhow::bail!("Unknown audit action: {name}"),
        },
        None => None,
    };

    let client = open_client(&data_dir)?;
    let entries = client.audit().query(&AuditQuery {
        city,
        institution,
        principal_id,
        action,
        limit: Some(limit),
        ..AuditQuery::default()
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        print_entries(&entries);
    }
    Ok(())
}

pub fn run_audit_summary(data_dir: String) -> anyhow::Result<()> {
    let client = open_client(&data_dir)?;
    println!("{}", serde_json::to_string_pretty(&client.audit().summary())?);
    Ok(())
}

pub fn run_audit_rebuild_summary(data_dir: String) -> anyhow::Result<()> {
    let client = open_client(&data_dir)?;
    let summary = client.audit().rebuild_summary()?;
    println!(
        "Rebuilt summary: {} actions by {} principals across {} cities",
        summary.total_actions,
        summary.users_connected.len(),
        summary.cities.len()
    );
    Ok(())
}

pub async fn run_audit_reconcile(data_dir: String) -> anyhow::Result<()> {
    let client = open_client(&data_dir)?;
    let pushed = client.audit().reconcile().await?;
    if pushed == 0 {
        println!("Remote audit log is complete.");
    } else {
        println!("Pushed {pushed} missing audit entries.");
    }
    Ok(())
}
