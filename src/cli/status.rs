use super::open_client;

pub fn run_status(data_dir: String, json: bool) -> anyhow::Result<()> {
    let client = open_client(&data_dir)?;
    let status = client.status();

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let sync = &status.sync;
    println!();
    println!("  Principal:     {}", sync.principal_id);
    println!("  Local version: {} ({})", sync.local_version, short_hash(&sync.local_hash));
    println!("  Pending:       {}", sync.sync_pending);
    match sync.last_download {
        Some(at) => println!("  Downloaded:    {}", at.to_rfc3339()),
        None => println!("  Downloaded:    never"),
    }
    if let Some(secs) = sync.staleness_secs {
        println!("  Cache age:     {secs}s");
    }
    println!("  Principals:    {}", status.cached_principals);
    println!("  Records:       {}", status.cached_records);
    println!("  Realtime:      {}", status.realtime);
    if status.needs_rebuild {
        println!();
        println!("  Local cache was reset; run 'rostersync sync' to rebuild it.");
    }
    println!();
    Ok(())
}

fn short_hash(hash: &str) -> &str {
    if hash.is_empty() {
        return "-";
    }
    hash.get(..12).unwrap_or(hash)
}
