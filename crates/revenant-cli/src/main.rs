use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use revenant_core::recovery::DescriptorKind;
use revenant_core::{EngineConfig, RecoveryEngine, RestoreStatus};

#[derive(Parser, Debug)]
#[command(
    name = "revenant",
    version,
    about = "Offline forensic recovery for journaled ext3-family filesystem images"
)]
struct Cli {
    /// Path to the filesystem image (never written to)
    image: PathBuf,

    /// Declare a legal-but-unlikely filename acceptable (repeatable)
    #[arg(long = "accept", value_name = "NAME", global = true)]
    accept: Vec<String>,

    /// Ignore deletions older than this Unix timestamp
    #[arg(long, value_name = "TIMESTAMP", global = true)]
    after: Option<u32>,

    /// Recompute both stages instead of using cache files
    #[arg(long, global = true)]
    no_cache: bool,

    /// Directory holding the stage cache files
    #[arg(long, value_name = "DIR", default_value = ".", global = true)]
    cache_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show superblock and journal facts about the image
    Info,
    /// List every recovered directory and file path
    DumpNames,
    /// Restore one path, or everything, into the output directory
    Restore {
        /// Root-relative path to restore
        path: Option<String>,
        /// Restore every recovered path
        #[arg(long, conflicts_with = "path")]
        all: bool,
        /// Output directory for restored files
        #[arg(long, value_name = "DIR", default_value = "RESTORED_FILES")]
        out: PathBuf,
    },
    /// Show journal statistics or one transaction's descriptors
    Journal {
        /// Transaction sequence number to inspect
        #[arg(long, value_name = "SEQ")]
        transaction: Option<u32>,
    },
    /// List inodes reachable through more than one recovered path
    Hardlinks,
    /// Emit a JSON summary of the scan
    Report,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let output_root = match &cli.command {
        Commands::Restore { out, .. } => out.clone(),
        _ => PathBuf::from("RESTORED_FILES"),
    };
    let config = EngineConfig {
        accepted_filenames: cli.accept.iter().cloned().collect::<BTreeSet<_>>(),
        after: cli.after,
        output_root,
        use_caches: !cli.no_cache,
        cache_dir: cli.cache_dir.clone(),
        ..EngineConfig::default()
    };
    let mut engine = RecoveryEngine::open(&cli.image, config)?;

    match cli.command {
        Commands::Info => {
            let sb = engine.fs().superblock().clone();
            println!("Image:           {}", cli.image.display());
            println!("Block size:      {}", engine.fs().block_size());
            println!("Blocks:          {}", sb.blocks_count);
            println!(
                "Inodes:          {} ({} per group)",
                sb.inodes_count, sb.inodes_per_group
            );
            println!("Block groups:    {}", engine.fs().group_count());
            println!("Journal inode:   {}", sb.journal_inum);
            let journal = engine.journal();
            println!(
                "Journal length:  {} blocks",
                journal.journal_superblock().maxlen
            );
            println!("Descriptors:     {}", journal.descriptor_count());
            println!(
                "Sequences:       {} .. {}",
                journal.min_sequence(),
                journal.max_sequence()
            );
            if let Some(sequence) = journal.wrapped_sequence() {
                println!("Wrapped at:      {}", sequence);
            }
        }
        Commands::DumpNames => {
            for path in engine.dump_names()? {
                println!("{}", path);
            }
        }
        Commands::Restore { path, all, .. } => {
            if all {
                let (restored, skipped) = engine.restore_all()?;
                println!("Restored {} paths, skipped {}", restored, skipped);
            } else {
                let path =
                    path.ok_or_else(|| anyhow::anyhow!("Give a path to restore, or pass --all"))?;
                match engine.restore(&path)? {
                    RestoreStatus::Restored => println!("Restored {}", path),
                    RestoreStatus::Skipped(reason) => {
                        println!("Did not restore {}: {}", path, reason)
                    }
                }
            }
        }
        Commands::Journal { transaction } => {
            let journal = engine.journal();
            match transaction {
                Some(sequence) => match journal.transaction(sequence) {
                    Some(txn) => {
                        let (prev, next) = journal.sequence_neighbors(sequence);
                        match (prev, next) {
                            (Some(p), Some(n)) => println!(
                                "Prev / Current / Next sequences: {} {} {}",
                                p, sequence, n
                            ),
                            (Some(p), None) => {
                                println!("Prev / Current sequences: {} {}", p, sequence)
                            }
                            (None, Some(n)) => {
                                println!("Current / Next sequences: {} {}", sequence, n)
                            }
                            (None, None) => println!("Sequence: {}", sequence),
                        }
                        if !txn.committed {
                            println!("Transaction was NOT committed!");
                        }
                        for &index in &txn.descriptors {
                            let descriptor = journal.descriptor(index);
                            match &descriptor.kind {
                                DescriptorKind::Tag { fs_block, .. } => {
                                    println!("TAG    {} = {}", descriptor.journal_block, fs_block)
                                }
                                DescriptorKind::Revoke { blocks } => {
                                    println!("REVOKE {:?}", blocks)
                                }
                                DescriptorKind::Commit => println!("COMMIT"),
                            }
                        }
                    }
                    None => {
                        println!("No transaction with sequence {} in the journal", sequence);
                        let (prev, next) = journal.sequence_neighbors(sequence);
                        if let Some(p) = prev {
                            println!("Prev sequence: {}", p);
                        }
                        if let Some(n) = next {
                            println!("Next sequence: {}", n);
                        }
                    }
                },
                None => {
                    println!("Descriptors: {}", journal.descriptor_count());
                    println!(
                        "Sequences:   {} .. {}",
                        journal.min_sequence(),
                        journal.max_sequence()
                    );
                    for txn in journal.transactions() {
                        println!(
                            "  sequence {} ({} descriptors){}",
                            txn.sequence,
                            txn.descriptors.len(),
                            if txn.committed { "" } else { " UNCOMMITTED" }
                        );
                    }
                }
            }
        }
        Commands::Hardlinks => {
            let groups = engine.hardlinks()?;
            if groups.is_empty() {
                println!("No inode is reachable through more than one path");
            }
            for (inode, paths) in groups {
                println!("Inode {}:", inode);
                for path in paths {
                    println!("  {}", path);
                }
            }
        }
        Commands::Report => {
            let report = engine.report()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
