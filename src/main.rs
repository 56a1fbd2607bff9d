// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

//! Loads generated rows into a fresh column store and prints the job summary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use itertools::Itertools;
use risinglight_bulkload::bulk::{BulkLoadOptions, ExtentMap, MemExtentMap, TableLoader};
use risinglight_bulkload::catalog::{CompressionMode, JobColumn};
use risinglight_bulkload::types::{DataType, DataValue, Oid, VolumeId};
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter;
use tracing_subscriber::prelude::*;

/// Bulk-load generated rows into a column store.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Root directory of the volumes.
    #[clap(short, long, default_value = "risinglight.bulkload")]
    path: PathBuf,

    /// Volumes to load into, in rotation order.
    #[clap(long, value_delimiter = ',', default_value = "1")]
    volumes: Vec<VolumeId>,

    /// Number of rows to generate.
    #[clap(short, long, default_value_t = 100_000)]
    rows: u64,

    /// Columns as `name:type[:auto]`, e.g. `id:bigint:auto,name:varchar(20)`.
    #[clap(
        short,
        long,
        value_delimiter = ',',
        default_value = "id:bigint:auto,qty:int,code:char(4),name:varchar(20)"
    )]
    columns: Vec<String>,

    /// Store segment files compressed.
    #[clap(long)]
    compressed: bool,

    /// Rows per extent.
    #[clap(long)]
    rows_per_extent: Option<u64>,

    /// Rows per batch handed to the loader.
    #[clap(long, default_value_t = 10_000)]
    batch_size: usize,
}

fn parse_column(idx: usize, desc: &str, compression: CompressionMode) -> Result<JobColumn> {
    let mut parts = desc.split(':');
    let (Some(name), Some(data_type)) = (parts.next(), parts.next()) else {
        bail!("invalid column: {desc}");
    };
    let data_type: DataType = data_type.parse().map_err(|e: String| anyhow!(e))?;
    let auto_increment = match parts.next() {
        None => false,
        Some("auto") => true,
        Some(other) => bail!("invalid column option: {other}"),
    };
    let oid = 3000 + 2 * idx as Oid;
    let mut column = JobColumn::new(idx as u32, name, oid, data_type)
        .with_compression(compression)
        .with_auto_increment(auto_increment);
    if data_type.is_dictionary() {
        column = column.with_dictionary_oid(oid + 1);
    }
    Ok(column)
}

fn generate(column: &JobColumn, rows: std::ops::Range<u64>) -> Vec<DataValue> {
    let data_type = column.data_type();
    rows.map(|row| {
        if column.is_auto_increment() {
            DataValue::Null
        } else if data_type.is_integer() {
            DataValue::Int((row % 1000) as i64)
        } else {
            DataValue::String(format!("v{}", row % 97))
        }
    })
    .collect()
}

fn main() -> Result<()> {
    let args = Args::parse();

    let fmt_layer = tracing_subscriber::fmt::layer().compact();
    let filter_layer =
        filter::EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into());

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    let mut options = BulkLoadOptions::default_for_cli();
    options.path = args.path;
    if let Some(rows) = args.rows_per_extent {
        options.rows_per_extent = rows;
        options.abbreviated_extent_rows = options
            .abbreviated_extent_rows
            .filter(|abbrev| *abbrev < rows);
    }
    let options = Arc::new(options);

    let compression = if args.compressed {
        CompressionMode::Compressed
    } else {
        CompressionMode::None
    };
    let columns = args
        .columns
        .iter()
        .enumerate()
        .map(|(idx, desc)| parse_column(idx, desc, compression))
        .collect::<Result<Vec<_>>>()?;
    info!(
        volumes = %args.volumes.iter().join(","),
        columns = %columns.iter().map(|c| format!("{}:{}", c.name(), c.data_type())).join(","),
        rows = args.rows,
        "starting load"
    );

    let extent_map: Arc<dyn ExtentMap> = Arc::new(MemExtentMap::new(&options));
    let table = TableLoader::new("demo", columns.clone(), &args.volumes, extent_map, options)?;
    table.init_auto_inc(1)?;

    let batch_size = args.batch_size.max(1) as u64;
    let mut start = 0;
    while start < args.rows {
        let end = (start + batch_size).min(args.rows);
        let batch = columns.iter().map(|c| generate(c, start..end)).collect();
        table.load_batch(batch)?;
        start = end;
    }

    let summary = table.finish()?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
