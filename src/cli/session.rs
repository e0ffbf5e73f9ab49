use tracing::info;

use super::open_client;

pub async fn run_login(
    data_dir: String,
    display_name: String,
    email: Option<String>,
) -> anyhow::Result<()> {
    let client = open_client(&data_dir)?;
    let subject = client.login(&display_name, email).await?;

    let role = if subject.principal.is_superuser {
        "superuser"
    } else if subject.principal.is_admin {
        "admin"
    } else {
        "member"
    };
    println!("Logged in as {} ({role})", subject.principal.display_name);
    Ok(())
}

/// Answers a permission question from the local cache only.
pub fn run_check(
    data_dir: String,
    action: String,
    city: Option<String>,
    institution: Option<String>,
) -> anyhow::Result<()> {
    let client = open_client(&data_dir)?;
    let allowed = client.can_perform_named(&action, city.as_deref(), institution.as_deref())?;
    println!("{}", if allowed { "allowed" } else { "denied" });
    Ok(())
}

/// Runs one full download and prints what was cached.
pub async fn run_sync(data_dir: String, json: bool) -> anyhow::Result<()> {
    let client = open_client(&data_dir)?;
    let report = client.sync().full_download().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!(
        "Synced version {}: {} principals, {} records ({} filtered), {} audit entries merged",
        report.version,
        report.principals_cached,
        report.records_cached,
        report.records_filtered,
        report.audit_merged
    );
    if report.backfilled > 0 {
        println!("Backfilled {} permission entries", report.backfilled);
    }
    Ok(())
}

/// Keeps the caches live until interrupted.
pub async fn run_watch(data_dir: String) -> anyhow::Result<()> {
    let client = open_client(&data_dir)?;
    client.start().await?;
    info!(principal = %client.principal_id(), "Watching for changes (Ctrl-C to stop)");

    let mut events = client.sync().subscribe();
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => tracing::debug!(?event, "Sync event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Skipped {n} sync events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    client.shutdown().await;
    info!("Stopped");
    Ok(())
}
