// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Example: capture a crash and upload it on the next run.
//!
//! Run with:
//!   LOOM_CRASH_API_KEY=... cargo run --example crash_demo -p loom-crash -- segfault
//!   LOOM_CRASH_API_KEY=... cargo run --example crash_demo -p loom-crash -- flush

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use loom_crash::{CrashConfig, CrashReporterBuilder, SymbolicationMode};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "crash_demo", about = "Exercise the loom-crash SDK")]
struct Args {
	/// Collection endpoint; defaults to LOOM_CRASH_BASE_URL or the hosted server.
	#[arg(long)]
	base_url: Option<String>,

	/// Queue directory; defaults to LOOM_CRASH_STORAGE_DIR or the per-user data dir.
	#[arg(long)]
	storage_dir: Option<std::path::PathBuf>,

	/// Leave symbolication to the server.
	#[arg(long)]
	deferred: bool,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Write through a null pointer.
	Segfault,
	/// Panic on the main thread.
	Panic,
	/// Abort the process.
	Abort,
	/// Log a handled error without crashing.
	Log,
	/// Upload whatever is queued and print the summary.
	Flush,
}

#[derive(Debug, thiserror::Error)]
#[error("settings sync failed")]
struct SyncError(#[source] std::io::Error);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,loom_crash=debug")),
		)
		.init();

	let args = Args::parse();

	let mut config = CrashConfig::from_env().context("reading LOOM_CRASH_* environment")?;
	if let Some(url) = args.base_url {
		config.base_url = url;
	}
	if let Some(dir) = args.storage_dir {
		config.storage_dir = Some(dir);
	}
	if args.deferred {
		config.symbolication = SymbolicationMode::Deferred;
	}
	// The flush command uploads in the foreground.
	config.flush_on_start = !matches!(args.command, Command::Flush);

	let reporter = CrashReporterBuilder::from_config(config)
		.start()
		.context("starting crash reporter (is LOOM_CRASH_API_KEY set?)")?;

	println!("storage: {}", reporter.storage_dir().display());
	println!("pending reports: {}", reporter.pending_reports()?);
	if reporter.crashed_last_launch() {
		println!("the previous run crashed");
	}

	reporter.set_user_identifier(Some("demo-user".to_string()));
	reporter.set_attribute("demo.command", Some(format!("{:?}", args.command)));
	reporter.leave_footprint("demo started");

	match args.command {
		Command::Segfault => {
			reporter.leave_footprint("about to dereference null");
			// SAFETY: none; this write is the point of the demo.
			unsafe { std::ptr::null_mut::<u64>().write_volatile(0xdead) };
		}
		Command::Panic => {
			let items: Vec<u32> = Vec::new();
			let index = items.len() + 3;
			println!("{}", items[index]);
		}
		Command::Abort => std::process::abort(),
		Command::Log => {
			let error = SyncError(std::io::Error::new(
				std::io::ErrorKind::TimedOut,
				"settings server did not answer",
			));
			let id = reporter.log_error_object(&error)?;
			println!("queued {id}");
		}
		Command::Flush => {
			let summary = reporter
				.flush_with_timeout(Duration::from_secs(60))
				.await
				.context("flushing crash reports")?;
			println!(
				"delivered {} failed {} retained {} duplicates {}",
				summary.delivered, summary.failed, summary.retained, summary.duplicates
			);
		}
	}

	reporter.shutdown().await?;
	Ok(())
}
