// src/main.rs

use std::fs::File;

use anyhow::{Context, Result};
use clap::Parser;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tracing::info;

use lagoon::{read_dataset, write_dataset, Catalog, WriteOptions};

mod cli;
use cli::{Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut catalog = Catalog::connect(&cli.catalog).context("failed to connect to catalog")?;

    match cli.command {
        Commands::Register { name, base_uri } => {
            let dataset_ref = catalog.register_dataset(&name, &base_uri)?;
            info!(dataset = %dataset_ref.name, base_uri = %dataset_ref.base_uri, "registered dataset");
            println!("registered dataset '{}' at {}", dataset_ref.name, dataset_ref.base_uri);
        }
        Commands::List => {
            let datasets = catalog.list_datasets()?;
            for ds in datasets {
                println!("{}\t{}\tversion={}", ds.name, ds.base_uri, ds.version);
            }
        }
        Commands::Write {
            dataset,
            input,
            base_uri,
            partition_by,
        } => {
            let file = File::open(&input).with_context(|| format!("failed to open input file '{input}'"))?;
            let reader_builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
            let reader = reader_builder.build()?;
            let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;

            let options = WriteOptions {
                partition_by,
                storage_options: None,
            };
            let result = write_dataset(&mut catalog, &dataset, base_uri.as_deref(), &batches, &options)?;
            info!(dataset = %result.dataset_ref.name, version = result.version, rows = result.row_count, "write committed");
            println!(
                "wrote {} rows across {} file(s) as version {}",
                result.row_count,
                result.files.len(),
                result.version
            );
        }
        Commands::Read {
            dataset,
            version,
            predicates,
        } => {
            let table = read_dataset(&mut catalog, &dataset, version, &predicates, None)?;
            println!("read {} rows across {} batch(es)", table.num_rows(), table.batches.len());
            if !table.batches.is_empty() {
                let formatted = arrow::util::pretty::pretty_format_batches(&table.batches)?;
                println!("{formatted}");
            }
        }
    }

    Ok(())
}
