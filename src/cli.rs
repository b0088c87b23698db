// src/cli.rs

//! Command-line argument definitions for the `lagoon` binary.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "lagoon")]
#[command(author, version, about = "Versioned Parquet dataset catalog and reader/writer", long_about = None)]
pub struct Cli {
    /// Catalog connection string (sqlite://<path> or :memory:)
    #[arg(short, long, global = true, default_value = "sqlite://lagoon.db")]
    pub catalog: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register a dataset against a storage location without writing data
    Register {
        /// Dataset name
        name: String,
        /// Storage base uri (file path or s3://bucket/prefix)
        base_uri: String,
    },
    /// List all registered datasets
    List,
    /// Write a Parquet file's contents into a dataset, creating it if absent
    Write {
        /// Dataset name or reference
        dataset: String,
        /// Path to a Parquet file to read and ingest
        input: String,
        /// Base uri to register the dataset with, if it doesn't exist yet
        #[arg(long)]
        base_uri: Option<String>,
        /// Columns to hive-partition by
        #[arg(long, value_delimiter = ',')]
        partition_by: Vec<String>,
    },
    /// Read a dataset, optionally pruning by predicates, and print summary stats
    Read {
        /// Dataset name or reference
        dataset: String,
        /// Version to read (defaults to the current version)
        #[arg(long)]
        version: Option<i64>,
        /// Predicate in the form column=op=value, e.g. `day=>=2024-01-01`.
        /// May be passed multiple times.
        #[arg(long = "predicate", value_parser = parse_predicate_arg)]
        predicates: Vec<(String, String, serde_json::Value)>,
    },
}

fn parse_predicate_arg(raw: &str) -> Result<(String, String, serde_json::Value), String> {
    let parts: Vec<&str> = raw.splitn(3, '=').collect();
    if parts.len() != 3 {
        return Err(format!("predicate '{raw}' must be in the form column=op=value"));
    }
    let value = serde_json::from_str(parts[2]).unwrap_or_else(|_| serde_json::Value::String(parts[2].to_string()));
    Ok((parts[0].to_string(), parts[1].to_string(), value))
}
