//! Subcommand handlers.

use std::path::Path;

use anyhow::{Context as _, Result};
use chrono::{TimeDelta, Utc};
use tempstash::{Context, Data, QueryFilter, Record, Stash, StashedItem};
use tracing::debug;

use crate::Commands;
use crate::since::parse_since;

const DEMO_NAMESPACE: &str = "examples";

pub(crate) async fn run(stash: &Stash, ctx: &Context, command: Commands) -> Result<()> {
    match command {
        Commands::Put {
            namespace,
            name,
            key,
            data,
            file,
            json,
            fire_and_forget,
        } => {
            let data = match (data, file) {
                (Some(text), _) => read_value(text.into_bytes(), json)?,
                (None, Some(path)) => read_value(read_file(&path)?, json)?,
                (None, None) => anyhow::bail!("one of --data or --file is required"),
            };
            let item = StashedItem::new(namespace, data)
                .with_name(name)
                .with_key(key);
            if fire_and_forget {
                debug!(namespace = %item.namespace, key = %item.key, "queueing async put");
                stash.put(ctx, item);
            } else {
                println!("{}", stash.put_sync(ctx, item).await?);
            }
        },
        Commands::Query {
            namespace,
            key,
            since,
            limit,
            json,
        } => {
            let mut filter = QueryFilter::new();
            if let Some(namespace) = namespace {
                filter = filter.namespace(namespace);
            }
            if let Some(key) = key {
                filter = filter.key(key);
            }
            if let Some(since) = since {
                filter = filter.since(parse_since(&since, Utc::now())?);
            }
            if let Some(limit) = limit {
                filter = filter.limit(limit);
            }
            let records = stash.query(ctx, &filter).await?;
            print_records(&records, json)?;
        },
        Commands::Drop { namespace, all } => {
            let scope = if all { None } else { namespace.as_deref() };
            let removed = stash.clear(ctx, scope).await?;
            println!("dropped {removed} record(s)");
        },
        Commands::Demo { file } => demo(stash, ctx, &file).await?,
    }
    Ok(())
}

/// Stash `path` under the demo namespace, then print the last minute of it.
async fn demo(stash: &Stash, ctx: &Context, path: &Path) -> Result<()> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let key = path
        .file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());

    let id = stash
        .put_sync(
            ctx,
            StashedItem::new(DEMO_NAMESPACE, source)
                .with_name("self-stash")
                .with_key(key),
        )
        .await?;
    println!("stashed: {id}");

    let since = Utc::now()
        .checked_sub_signed(TimeDelta::minutes(1))
        .context("clock out of range")?;
    let records = stash
        .query(ctx, &QueryFilter::new().namespace(DEMO_NAMESPACE).since(since))
        .await?;
    print_records(&records, false)
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

/// Turn raw input into a payload. With `json`, the input must parse and is
/// stored in canonical encoding; otherwise it is stored verbatim.
fn read_value(raw: Vec<u8>, json: bool) -> Result<Data> {
    if json {
        let value: serde_json::Value =
            serde_json::from_slice(&raw).context("value is not valid JSON")?;
        Ok(Data::from(value))
    } else {
        Ok(Data::from(raw))
    }
}

fn print_records(records: &[Record], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(records)?);
        return Ok(());
    }
    for r in records {
        println!(
            "--- {} [{}] {} ---\n{}",
            r.name,
            r.key,
            r.created_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            r.data
        );
    }
    Ok(())
}
