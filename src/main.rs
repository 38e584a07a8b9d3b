use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use labflow::dispatch::AttemptDisposition;
use labflow::{
    config, export_delivery_log, export_range, init_config, init_telemetry, shutdown_telemetry,
    BatchSubmission, Channel, LabSystem, LabflowConfig, QcStatus, SampleId, SampleStage,
    SampleSubmission, ShutdownCoordinator, Urgency, WorklistQuery, MAX_DELIVERY_ATTEMPTS,
};

#[derive(Parser)]
#[command(name = "labflow")]
#[command(about = "Laboratory report lifecycle orchestration")]
#[command(long_about = "Labflow drives laboratory samples from technologist verification through \
                       pathologist authorization to multi-channel report delivery, backed by \
                       append-only ledgers and a full audit trail. Get started with 'labflow init' \
                       and 'labflow ingest'.")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a labflow.toml with the default configuration
    Init {
        /// Overwrite an existing labflow.toml
        #[arg(long, help = "Overwrite an existing labflow.toml")]
        force: bool,
    },
    /// Display worklist, dispatch, and failed-queue overview
    Status,
    /// Admit samples from a JSON submission file
    Ingest {
        /// Path to the submission file
        file: PathBuf,
        /// Treat the file as a whole instrument batch
        #[arg(long, help = "Treat the file as an instrument batch instead of a single sample")]
        batch: bool,
        #[arg(long, default_value = "intake", help = "Operator recorded on the intake audit trail")]
        actor: String,
    },
    /// List worklist entries with optional filters
    Worklist {
        /// Filter by lifecycle stage
        #[arg(
            long,
            help = "Stage filter: verification, authorization, dispatch-ready, dispatched, manual-intervention"
        )]
        stage: Option<String>,
        /// Free-text search
        #[arg(long, help = "Case-insensitive search over id, patient, test, and technologist")]
        search: Option<String>,
        /// Only samples bounced back by a pathologist
        #[arg(long, help = "Only samples returned for re-verification")]
        returned: bool,
        #[arg(long, default_value = "1", help = "1-based page number")]
        page: usize,
    },
    /// Submit a verified sample to the authorization queue
    Verify {
        sample_id: String,
        #[arg(long, default_value = "pass", help = "Quality control verdict: pass, fail, pending")]
        qc: String,
        #[arg(long, default_value = "operator", help = "Technologist recorded on the audit trail")]
        actor: String,
    },
    /// Return a sample from authorization back to verification
    Return {
        sample_id: String,
        /// Reason handed back to the technologist
        #[arg(long, help = "Reason handed back to the technologist (required)")]
        reason: String,
        /// Escalate the rework to STAT urgency
        #[arg(long, help = "Escalate the rework to STAT urgency")]
        urgent: bool,
        #[arg(long, default_value = "operator", help = "Pathologist recorded on the audit trail")]
        actor: String,
    },
    /// Sign an interpretation and release the report for dispatch
    Authorize {
        sample_id: String,
        #[arg(long, help = "Clinical interpretation text (required)")]
        interpretation: String,
        #[arg(long, help = "Pathologist signature (required)")]
        signature: String,
        /// Park the report instead of delivering immediately
        #[arg(long, help = "Park the report instead of delivering immediately")]
        hold: bool,
        #[arg(long, default_value = "operator", help = "Pathologist recorded on the audit trail")]
        actor: String,
    },
    /// Approve every clean member of an instrument batch at once
    BulkApprove {
        batch_id: String,
        /// Restrict the approval to chosen members
        #[arg(long, value_delimiter = ',', help = "Comma-separated sample ids to approve")]
        samples: Option<Vec<String>>,
        #[arg(long, default_value = "operator", help = "Pathologist recorded on the audit trail")]
        actor: String,
    },
    /// Fan parked reports out to their delivery channels
    Dispatch {
        /// Dispatch a single parked report
        #[arg(long, help = "Dispatch one parked report instead of the whole queue")]
        report: Option<String>,
        #[arg(long, default_value = "operator")]
        actor: String,
    },
    /// Manually retry a failed delivery channel
    Retry {
        report_id: String,
        #[arg(long, help = "Channel to retry: email, sms, print, portal")]
        channel: String,
        #[arg(long, default_value = "operator")]
        actor: String,
    },
    /// List the failed deliveries queue
    Failed,
    /// Close out a sample parked in manual intervention
    Resolve {
        sample_id: String,
        #[arg(long, help = "Resolution note (required)")]
        note: String,
        #[arg(long, default_value = "operator")]
        actor: String,
    },
    /// Pull a released report back and park the sample for review
    Recall {
        sample_id: String,
        #[arg(long, help = "Recall reason (required)")]
        reason: String,
        #[arg(long, default_value = "operator")]
        actor: String,
    },
    /// Show an audit timeline or export the trail as CSV
    Audit {
        /// Timeline for one sample or report instead of a CSV export
        #[arg(long, help = "Only events for this sample or report id")]
        subject: Option<String>,
        #[arg(long, help = "Inclusive RFC 3339 lower bound, default 30 days back")]
        from: Option<String>,
        #[arg(long, help = "Exclusive RFC 3339 upper bound, default now")]
        to: Option<String>,
        /// One row per dispatched report instead of raw audit events
        #[arg(long, help = "Export the flat delivery record per report")]
        deliveries: bool,
        #[arg(long, help = "Write the CSV here instead of stdout")]
        output: Option<PathBuf>,
    },
    /// Run the dispatch daemon until interrupted
    Serve,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    LabflowConfig::load_env_file()?;
    init_config()?;
    init_telemetry(&config()?.observability)?;

    let result = match cli.command {
        // Default behavior: no subcommand - explain how to get started
        None => show_getting_started(),
        Some(Commands::Init { force }) => init_command(force),
        Some(Commands::Status) => {
            tokio::runtime::Runtime::new()?.block_on(async { status_command().await })
        }
        Some(Commands::Ingest { file, batch, actor }) => tokio::runtime::Runtime::new()?
            .block_on(async { ingest_command(&file, batch, &actor).await }),
        Some(Commands::Worklist {
            stage,
            search,
            returned,
            page,
        }) => tokio::runtime::Runtime::new()?
            .block_on(async { worklist_command(stage, search, returned, page).await }),
        Some(Commands::Verify {
            sample_id,
            qc,
            actor,
        }) => tokio::runtime::Runtime::new()?
            .block_on(async { verify_command(&sample_id, &qc, &actor).await }),
        Some(Commands::Return {
            sample_id,
            reason,
            urgent,
            actor,
        }) => tokio::runtime::Runtime::new()?
            .block_on(async { return_command(&sample_id, &reason, urgent, &actor).await }),
        Some(Commands::Authorize {
            sample_id,
            interpretation,
            signature,
            hold,
            actor,
        }) => tokio::runtime::Runtime::new()?.block_on(async {
            authorize_command(&sample_id, &interpretation, &signature, hold, &actor).await
        }),
        Some(Commands::BulkApprove {
            batch_id,
            samples,
            actor,
        }) => tokio::runtime::Runtime::new()?
            .block_on(async { bulk_approve_command(&batch_id, samples, &actor).await }),
        Some(Commands::Dispatch { report, actor }) => tokio::runtime::Runtime::new()?
            .block_on(async { dispatch_command(report, &actor).await }),
        Some(Commands::Retry {
            report_id,
            channel,
            actor,
        }) => tokio::runtime::Runtime::new()?
            .block_on(async { retry_command(&report_id, &channel, &actor).await }),
        Some(Commands::Failed) => {
            tokio::runtime::Runtime::new()?.block_on(async { failed_command().await })
        }
        Some(Commands::Resolve {
            sample_id,
            note,
            actor,
        }) => tokio::runtime::Runtime::new()?
            .block_on(async { resolve_command(&sample_id, &note, &actor).await }),
        Some(Commands::Recall {
            sample_id,
            reason,
            actor,
        }) => tokio::runtime::Runtime::new()?
            .block_on(async { recall_command(&sample_id, &reason, &actor).await }),
        Some(Commands::Audit {
            subject,
            from,
            to,
            deliveries,
            output,
        }) => tokio::runtime::Runtime::new()?
            .block_on(async { audit_command(subject, from, to, deliveries, output).await }),
        Some(Commands::Serve) => {
            tokio::runtime::Runtime::new()?.block_on(async { serve_command().await })
        }
    };

    shutdown_telemetry();
    result
}

/// One-shot commands deliver synchronously so the outcome can be
/// printed; background fan-out belongs to the serve daemon.
async fn boot_system() -> Result<LabSystem> {
    let mut cfg = config()?.clone();
    cfg.dispatch.auto_dispatch = false;
    let system = LabSystem::new(cfg);
    system.boot().await?;
    Ok(system)
}

fn show_getting_started() -> Result<()> {
    println!("🧪 LABFLOW - Laboratory Report Lifecycle");
    println!("========================================");
    println!();
    println!("🎯 TYPICAL FLOW:");
    println!("   → labflow init                                  # Write default configuration");
    println!("   → labflow ingest samples.json --batch           # Admit an instrument run");
    println!("   → labflow worklist --stage verification         # See what needs review");
    println!("   → labflow verify S-1001                         # Send a sample to authorization");
    println!("   → labflow authorize S-1001 \\");
    println!("       --interpretation 'Within normal limits' \\");
    println!("       --signature 'Dr. Chen'                      # Release and deliver the report");
    println!();
    println!("📊 MONITORING:");
    println!("   → labflow status       # Worklist and delivery overview");
    println!("   → labflow failed       # Deliveries needing attention");
    println!("   → labflow audit        # Compliance CSV export");
    println!();
    println!("📡 Run 'labflow serve' to keep retry timers running between commands.");
    Ok(())
}

fn init_command(force: bool) -> Result<()> {
    println!("🧪 Initializing labflow workspace");
    println!();

    if Path::new("labflow.toml").exists() && !force {
        println!("⚠️  labflow.toml already exists");
        println!("   → Use --force to overwrite it with defaults");
        return Ok(());
    }

    let cfg = LabflowConfig::default();
    cfg.save_to_file("labflow.toml")?;
    println!("✅ Wrote labflow.toml");

    std::fs::create_dir_all(&cfg.storage.data_dir)?;
    println!("📁 Created ledger directory at {}", cfg.storage.data_dir);
    println!();
    println!("🎯 NEXT STEPS:");
    println!("   → Admit samples:  labflow ingest <file> [--batch]");
    println!("   → Check the lab:  labflow status");
    Ok(())
}

async fn status_command() -> Result<()> {
    println!("🧪 LABFLOW SYSTEM STATUS");
    println!("=========================");
    println!();

    let system = boot_system().await?;

    println!("🔬 VERIFICATION WORKLIST:");
    println!("─────────────────────────");
    let stats = system.index().verification_stats();
    println!("   📋 Pending verification: {}", stats.total_pending);
    if stats.stat_pending > 0 {
        println!("   🔴 STAT waiting: {}", stats.stat_pending);
    }
    if stats.critical_flags > 0 {
        println!("   🚨 Critical flags: {}", stats.critical_flags);
    }
    if stats.returned > 0 {
        println!("   ↩️  Returned for rework: {}", stats.returned);
    }
    println!();

    println!("📊 SAMPLES BY STAGE:");
    println!("────────────────────");
    let samples = system.registry().all().await;
    if samples.is_empty() {
        println!("   📭 No samples registered");
        println!("   💡 Admit samples with: labflow ingest <file>");
    } else {
        for stage in [
            SampleStage::Verification,
            SampleStage::Authorization,
            SampleStage::DispatchReady,
            SampleStage::Dispatched,
            SampleStage::ManualIntervention,
        ] {
            let count = samples.iter().filter(|s| s.stage == stage).count();
            if count > 0 {
                println!("   {} {}: {}", stage_emoji(stage), stage, count);
            }
        }
        println!("   📦 Total: {}", samples.len());
    }
    println!();

    println!("📤 REPORT DELIVERY:");
    println!("───────────────────");
    let parked = system.coordinator().ready_reports().await;
    let dispatch = system.coordinator().dispatch_stats().await;
    println!("   ⏸️  Parked for dispatch: {}", parked.len());
    println!("   📬 Dispatched reports: {}", dispatch.total);
    if dispatch.total > 0 {
        println!("      ✅ Delivered: {}", dispatch.delivered);
        println!("      🔄 In progress: {}", dispatch.pending);
        if dispatch.partial > 0 {
            println!("      🟡 Partial: {}", dispatch.partial);
        }
        if dispatch.failed > 0 {
            println!("      🔴 Failed: {}", dispatch.failed);
        }
    }
    println!();

    let failed = system.coordinator().failed_queue_stats().await;
    if failed.total > 0 {
        println!("🚑 FAILED DELIVERIES:");
        println!("─────────────────────");
        println!(
            "   🔴 {} channel(s) failing, {} exhausted, {:.1} attempts on average",
            failed.total, failed.exhausted, failed.average_attempts
        );
        for (reason, count) in failed.by_reason.iter().take(3) {
            println!("      • {count}× {reason}");
        }
        println!("   💡 Inspect with: labflow failed");
        println!();
    }

    println!("🎯 QUICK ACTIONS:");
    println!("   → labflow worklist --stage verification   # Review pending samples");
    println!("   → labflow dispatch                        # Deliver parked reports");
    println!("   → labflow audit                           # Export the audit trail");
    Ok(())
}

async fn ingest_command(file: &Path, batch: bool, actor: &str) -> Result<()> {
    println!("📥 Admitting submissions from {}", file.display());
    println!();

    let payload = std::fs::read_to_string(file)?;
    let system = boot_system().await?;

    if batch {
        let submission: BatchSubmission = serde_json::from_str(&payload)?;
        let outcome = system.intake().ingest_batch(submission, actor).await?;
        println!("✅ Batch {} admitted", outcome.batch.batch_id);
        println!("   🏭 Instrument: {}", outcome.batch.instrument_id);
        println!("   📋 Accepted: {}", outcome.accepted.len());
        println!("   🟢 Normal results: {}", outcome.batch.normal_results);
        println!("   🟡 Exceptions: {}", outcome.batch.exceptions);
        if !outcome.rejected.is_empty() {
            println!("   ⚠️  Rejected {} member(s):", outcome.rejected.len());
            for reject in &outcome.rejected {
                println!("      • {}: {}", reject.sample_id, reject.reason);
            }
        }
        println!();
        println!(
            "🎯 Approve the clean members with: labflow bulk-approve {}",
            outcome.batch.batch_id
        );
    } else {
        let submission: SampleSubmission = serde_json::from_str(&payload)?;
        let sample = system.intake().ingest_sample(submission, actor).await?;
        println!("✅ Sample {} admitted for verification", sample.sample_id);
        println!("   🧍 Patient: {}", sample.patient_name);
        println!("   🧪 Test: {}", sample.test_type);
        println!("   🚩 Flag: {}", sample.flag);
        if sample.urgency == Urgency::Stat {
            println!("   🔴 Urgency: STAT");
        }
    }
    Ok(())
}

async fn worklist_command(
    stage: Option<String>,
    search: Option<String>,
    returned: bool,
    page: usize,
) -> Result<()> {
    let stage = stage.as_deref().map(parse_stage).transpose()?;
    let system = boot_system().await?;

    let query = WorklistQuery {
        stage,
        qc_status: None,
        flag: None,
        urgency: None,
        returned_only: returned,
        search,
        page,
        page_size: system.config().worklist.page_size as usize,
    };
    let result = system.index().query(&query);

    println!("📋 WORKLIST");
    println!("===========");
    if result.entries.is_empty() {
        println!("📭 No matching samples");
        return Ok(());
    }
    for entry in &result.entries {
        let urgency = match entry.urgency {
            Urgency::Stat => "🔴 STAT   ",
            Urgency::Routine => "⚪ routine",
        };
        let mut line = format!(
            "{} {} {:18} {:12} {:16} {}",
            urgency,
            stage_emoji(entry.stage),
            entry.stage.to_string(),
            entry.sample_id.to_string(),
            entry.patient_name,
            entry.test_type,
        );
        if entry.flag != labflow::FlagLevel::Normal {
            line.push_str(&format!("  🚩 {}", entry.flag));
        }
        if let Some(ret) = &entry.returned {
            line.push_str(&format!("  ↩️  returned: {}", ret.reason));
        }
        if let Some(status) = &entry.delivery_status {
            line.push_str(&format!("  📤 {status}"));
        }
        println!("{line}");
    }
    println!();
    println!(
        "📄 Page {}/{} ({} matching sample(s))",
        result.page, result.page_count, result.total
    );
    Ok(())
}

async fn verify_command(sample_id: &str, qc: &str, actor: &str) -> Result<()> {
    let qc = parse_qc(qc)?;
    let system = boot_system().await?;
    let id = SampleId(sample_id.to_string());

    match system.machine().submit_verification(&id, actor, qc).await {
        Ok(sample) => {
            println!(
                "✅ Sample {} verified and sent to authorization",
                sample.sample_id
            );
            println!("   🧍 Patient: {}", sample.patient_name);
            println!("   🧪 Quality control: {}", sample.qc_status);
            println!();
            println!(
                "🎯 Next: labflow authorize {} --interpretation '...' --signature '...'",
                sample.sample_id
            );
            Ok(())
        }
        Err(e) => {
            println!("❌ Verification rejected: {e}");
            println!("   💡 Check the sample with: labflow worklist --search {sample_id}");
            Err(e.into())
        }
    }
}

async fn return_command(sample_id: &str, reason: &str, urgent: bool, actor: &str) -> Result<()> {
    let system = boot_system().await?;
    let id = SampleId(sample_id.to_string());

    let sample = system
        .machine()
        .return_for_verification(&id, actor, reason, urgent)
        .await?;
    println!("↩️  Sample {} returned to verification", sample.sample_id);
    println!("   📝 Reason: {reason}");
    if urgent {
        println!("   🔴 Escalated to STAT");
    }
    println!();
    println!(
        "🎯 The technologist re-submits with: labflow verify {}",
        sample.sample_id
    );
    Ok(())
}

async fn authorize_command(
    sample_id: &str,
    interpretation: &str,
    signature: &str,
    hold: bool,
    actor: &str,
) -> Result<()> {
    let system = boot_system().await?;
    let id = SampleId(sample_id.to_string());

    let report = match system
        .machine()
        .authorize(&id, actor, interpretation, signature)
        .await
    {
        Ok(report) => report,
        Err(e) => {
            println!("❌ Authorization rejected: {e}");
            return Err(e.into());
        }
    };

    println!("✅ Report {} authorized", report.report_id);
    println!("   🧍 Patient: {}", report.patient_name);
    println!("   ✍️  Signed: {}", report.signature);

    if hold {
        println!("   ⏸️  Report parked; deliver later with: labflow dispatch");
        return Ok(());
    }

    let sample = system
        .machine()
        .sample(&id)
        .await
        .ok_or_else(|| anyhow!("sample {sample_id} vanished after authorization"))?;
    if sample.delivery_channels.is_empty() {
        println!("   ⏸️  No delivery channels configured; report stays parked");
        return Ok(());
    }

    println!();
    println!(
        "📤 Delivering on {} channel(s)...",
        sample.delivery_channels.len()
    );
    let status = system
        .coordinator()
        .dispatch_ready(&report.report_id, sample.delivery_channels, actor)
        .await?;
    print_delivery_summary(&system, &report.report_id).await;
    println!();
    println!("📊 Aggregate status: {status}");
    Ok(())
}

async fn bulk_approve_command(
    batch_id: &str,
    samples: Option<Vec<String>>,
    actor: &str,
) -> Result<()> {
    let system = boot_system().await?;
    let batch = system.intake().batch(batch_id).await?;
    let selection: Option<Vec<SampleId>> =
        samples.map(|ids| ids.into_iter().map(SampleId).collect());

    println!(
        "📦 Bulk approval for batch {} ({})",
        batch.batch_id, batch.name
    );
    println!();

    let outcome = system
        .machine()
        .bulk_approve(&batch, actor, selection.as_deref())
        .await?;

    println!("✅ Approved {} sample(s)", outcome.approved.len());
    for id in &outcome.approved {
        println!("   ✔️  {id}");
    }
    if !outcome.skipped.is_empty() {
        println!(
            "⚠️  Skipped {} sample(s) for individual review:",
            outcome.skipped.len()
        );
        for skip in &outcome.skipped {
            println!("   • {}: {}", skip.sample_id, skip.reason);
        }
    }
    println!();
    println!("🎯 Approved samples are in AUTHORIZATION, release them with: labflow authorize <id> ...");
    Ok(())
}

async fn dispatch_command(report: Option<String>, actor: &str) -> Result<()> {
    let system = boot_system().await?;

    let parked = system.coordinator().ready_reports().await;
    if parked.is_empty() {
        println!("📭 No reports parked for dispatch");
        return Ok(());
    }

    let targets: Vec<_> = match &report {
        Some(report_id) => parked
            .into_iter()
            .filter(|r| r.report_id.as_str() == report_id)
            .collect(),
        None => parked,
    };
    if targets.is_empty() {
        return Err(anyhow!(
            "report {} is not waiting for dispatch",
            report.unwrap_or_default()
        ));
    }

    println!("📤 Dispatching {} report(s)", targets.len());
    println!();
    let mut delivered = 0;
    let mut parked_back = 0;
    for report in targets {
        let Some(sample) = system.machine().sample(&report.sample_id).await else {
            parked_back += 1;
            println!(
                "   ❓ {}: sample {} not found, report stays parked",
                report.report_id, report.sample_id
            );
            continue;
        };
        if sample.delivery_channels.is_empty() {
            parked_back += 1;
            println!(
                "   ⏸️  {}: no delivery channels configured",
                report.report_id
            );
            continue;
        }
        match system
            .coordinator()
            .dispatch_ready(&report.report_id, sample.delivery_channels, actor)
            .await
        {
            Ok(status) => {
                delivered += 1;
                println!(
                    "   📬 {} ({}) → {}",
                    report.report_id, sample.patient_name, status
                );
            }
            Err(e) => {
                parked_back += 1;
                println!("   ❌ {}: {}", report.report_id, e);
            }
        }
    }
    println!();
    println!("📊 {delivered} dispatched, {parked_back} left parked");
    if parked_back > 0 {
        println!("   💡 Failing channels retry automatically while 'labflow serve' runs");
    }
    Ok(())
}

async fn retry_command(report_id: &str, channel: &str, actor: &str) -> Result<()> {
    let channel = parse_channel(channel)?;
    let system = boot_system().await?;
    let id = labflow::ReportId(report_id.to_string());

    println!("🔁 Retrying {channel} delivery for report {report_id}");
    match system.coordinator().manual_retry(&id, channel, actor).await {
        Ok(AttemptDisposition::Delivered) => {
            println!("✅ Delivered on {channel}");
            print_delivery_summary(&system, &id).await;
            Ok(())
        }
        Ok(AttemptDisposition::FailedRetryable { failed_attempt }) => {
            println!(
                "🔴 Failed again (attempt {failed_attempt} of {MAX_DELIVERY_ATTEMPTS}); a retry timer is armed"
            );
            println!("   💡 Timers only fire while 'labflow serve' runs");
            Ok(())
        }
        Ok(AttemptDisposition::FailedExhausted) => {
            println!("❌ Attempt budget exhausted; only manual resolution remains");
            println!("   💡 Resolve the sample with: labflow resolve <sample-id> --note '...'");
            Ok(())
        }
        Ok(AttemptDisposition::FailedCancelled) => {
            println!("🚫 Report was recalled; no further retries");
            Ok(())
        }
        Ok(AttemptDisposition::Skipped { reason }) => {
            println!("⏭️  Nothing to do: {reason}");
            Ok(())
        }
        Err(e) => {
            println!("❌ Retry rejected: {e}");
            Err(e.into())
        }
    }
}

async fn failed_command() -> Result<()> {
    let system = boot_system().await?;

    println!("🚑 FAILED DELIVERIES");
    println!("====================");
    println!();

    let rows = system.coordinator().failed_deliveries().await;
    if rows.is_empty() {
        println!("✅ No failed deliveries");
        return Ok(());
    }

    for row in &rows {
        let marker = if row.recalled {
            "🚫 recalled "
        } else if row.exhausted {
            "❌ exhausted"
        } else {
            "🔴 retrying "
        };
        println!(
            "{} {} {:16} {:12} {} attempt {}/{} - {}",
            marker,
            row.report_id,
            row.patient_name,
            row.test_type,
            row.channel,
            row.attempt_count,
            MAX_DELIVERY_ATTEMPTS,
            row.failure_reason,
        );
    }
    println!();
    let stats = system.coordinator().failed_queue_stats().await;
    println!(
        "📊 {} failing channel(s), {} exhausted, {:.1} attempts on average",
        stats.total, stats.exhausted, stats.average_attempts
    );
    println!();
    println!("🎯 ACTIONS:");
    println!("   → labflow retry <report-id> --channel <channel>   # Retry now");
    println!("   → labflow recall <sample-id> --reason '...'       # Pull the report back");
    Ok(())
}

async fn resolve_command(sample_id: &str, note: &str, actor: &str) -> Result<()> {
    let system = boot_system().await?;
    let id = SampleId(sample_id.to_string());

    let sample = system.machine().resolve_manual(&id, actor, note).await?;
    println!("✅ Intervention for sample {} closed out", sample.sample_id);
    println!("   📝 {note}");
    Ok(())
}

async fn recall_command(sample_id: &str, reason: &str, actor: &str) -> Result<()> {
    let system = boot_system().await?;
    let id = SampleId(sample_id.to_string());

    match system.machine().recall(&id, actor, reason).await {
        Ok(sample) => {
            println!("🚨 Sample {} recalled", sample.sample_id);
            println!("   📝 Reason: {reason}");
            println!("   🛑 Pending deliveries cancelled; sample parked for manual intervention");
            println!();
            println!(
                "🎯 Close it out with: labflow resolve {} --note '...'",
                sample.sample_id
            );
            Ok(())
        }
        Err(e) => {
            println!("❌ Recall rejected: {e}");
            println!("   💡 Only released samples (DISPATCH_READY or DISPATCHED) can be recalled");
            Err(e.into())
        }
    }
}

async fn audit_command(
    subject: Option<String>,
    from: Option<String>,
    to: Option<String>,
    deliveries: bool,
    output: Option<PathBuf>,
) -> Result<()> {
    let system = boot_system().await?;

    if let Some(subject) = subject {
        let events = system.audit().load_for_subject(&subject).await?;
        println!("📜 AUDIT TRAIL FOR {subject}");
        println!("================================");
        if events.is_empty() {
            println!("📭 No events recorded");
            return Ok(());
        }
        for event in &events {
            let transition = match &event.from_state {
                Some(from) => format!("{} → {}", from, event.to_state),
                None => event.to_state.clone(),
            };
            let note = event
                .note
                .as_deref()
                .map(|n| format!("  ({n})"))
                .unwrap_or_default();
            println!(
                "🕐 {}  {:20} {}{}",
                event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                event.actor,
                transition,
                note
            );
        }
        return Ok(());
    }

    let to = match to {
        Some(raw) => parse_timestamp(&raw)?,
        None => Utc::now(),
    };
    let from = match from {
        Some(raw) => parse_timestamp(&raw)?,
        None => to - ChronoDuration::days(30),
    };
    let (csv, what) = if deliveries {
        let rows = system.coordinator().overview().await;
        (export_delivery_log(&rows, from, to), "delivery record(s)")
    } else {
        (
            export_range(system.audit().as_ref(), from, to).await?,
            "audit event(s)",
        )
    };

    match output {
        Some(path) => {
            std::fs::write(&path, &csv)?;
            let rows = csv.lines().count().saturating_sub(1);
            println!("✅ Exported {} {} to {}", rows, what, path.display());
        }
        None => print!("{csv}"),
    }
    Ok(())
}

async fn serve_command() -> Result<()> {
    let cfg = config()?.clone();

    // One daemon per data directory.
    std::fs::create_dir_all(&cfg.storage.data_dir)?;
    let lock_path = Path::new(&cfg.storage.data_dir).join("labflow.lock");
    let lock_file = File::create(lock_path)?;
    let lock = Box::leak(Box::new(fd_lock::RwLock::new(lock_file)));
    let _guard = lock.try_write().map_err(|_| {
        anyhow!("Another labflow daemon is already running against this data directory")
    })?;

    println!("🧪 LABFLOW DISPATCH DAEMON");
    println!("===========================");
    println!();

    let system = LabSystem::new(cfg);
    let boot = system.boot().await?;
    println!(
        "📥 Restored {} sample(s), {} report(s)",
        boot.restored.samples, boot.restored.reports
    );
    if boot.restored.reparked > 0 {
        println!(
            "⏸️  {} report(s) back on the dispatch queue",
            boot.restored.reparked
        );
    }
    if boot.recovery.retries_resumed > 0 {
        println!("🔁 {} retry timer(s) re-armed", boot.recovery.retries_resumed);
    }
    if boot.recovery.interrupted_attempts > 0 {
        println!(
            "🔄 {} interrupted attempt(s) rescheduled",
            boot.recovery.interrupted_attempts
        );
    }

    let (sent, held) = drain_parked(&system).await?;
    if sent + held > 0 {
        println!("📤 Startup dispatch: {sent} delivered, {held} left parked");
    }
    println!();
    println!("📡 Delivering reports and running retries (Ctrl-C to stop)");

    ShutdownCoordinator::new(Arc::clone(system.coordinator()))
        .wait_for_shutdown()
        .await?;
    println!("👋 Labflow daemon stopped");
    Ok(())
}

/// Dispatch everything parked on the ready queue. Reports without
/// channels or with missing samples stay parked.
async fn drain_parked(system: &LabSystem) -> Result<(usize, usize)> {
    let parked = system.coordinator().ready_reports().await;
    let mut sent = 0;
    let mut held = 0;
    for report in parked {
        let Some(sample) = system.machine().sample(&report.sample_id).await else {
            held += 1;
            continue;
        };
        if sample.delivery_channels.is_empty() {
            held += 1;
            continue;
        }
        match system
            .coordinator()
            .dispatch_ready(
                &report.report_id,
                sample.delivery_channels,
                labflow::dispatch::DISPATCH_ACTOR,
            )
            .await
        {
            Ok(_) => sent += 1,
            Err(_) => held += 1,
        }
    }
    Ok((sent, held))
}

async fn print_delivery_summary(system: &LabSystem, report_id: &labflow::ReportId) {
    if let Some(attempts) = system.coordinator().attempts_for(report_id).await {
        let mut latest: std::collections::HashMap<Channel, &labflow::DeliveryAttempt> =
            std::collections::HashMap::new();
        for attempt in &attempts {
            latest.insert(attempt.channel, attempt);
        }
        let mut channels: Vec<_> = latest.into_iter().collect();
        channels.sort_by_key(|(c, _)| c.as_str());
        for (channel, attempt) in channels {
            let marker = match attempt.outcome {
                labflow::AttemptOutcome::Delivered => "✅",
                labflow::AttemptOutcome::Failed => "🔴",
                labflow::AttemptOutcome::Pending => "🔄",
            };
            match &attempt.failure_reason {
                Some(reason) => println!("   {marker} {channel}: {reason}"),
                None => println!("   {marker} {channel}: {}", attempt.outcome),
            }
        }
    }
}

fn stage_emoji(stage: SampleStage) -> &'static str {
    match stage {
        SampleStage::Verification => "🔬",
        SampleStage::Authorization => "✍️ ",
        SampleStage::DispatchReady => "📮",
        SampleStage::Dispatched => "📬",
        SampleStage::ManualIntervention => "🚨",
    }
}

fn parse_stage(raw: &str) -> Result<SampleStage> {
    match raw.to_ascii_lowercase().replace('_', "-").as_str() {
        "verification" => Ok(SampleStage::Verification),
        "authorization" => Ok(SampleStage::Authorization),
        "dispatch-ready" | "ready" => Ok(SampleStage::DispatchReady),
        "dispatched" => Ok(SampleStage::Dispatched),
        "manual-intervention" | "manual" => Ok(SampleStage::ManualIntervention),
        other => Err(anyhow!(
            "unknown stage '{other}', expected verification, authorization, dispatch-ready, dispatched, or manual-intervention"
        )),
    }
}

fn parse_qc(raw: &str) -> Result<QcStatus> {
    match raw.to_ascii_lowercase().as_str() {
        "pass" => Ok(QcStatus::Pass),
        "fail" => Ok(QcStatus::Fail),
        "pending" => Ok(QcStatus::Pending),
        other => Err(anyhow!(
            "unknown quality control verdict '{other}', expected pass, fail, or pending"
        )),
    }
}

fn parse_channel(raw: &str) -> Result<Channel> {
    raw.parse::<Channel>()
        .map_err(|_| anyhow!("unknown channel '{raw}', expected email, sms, print, or portal"))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| anyhow!("could not parse '{raw}' as RFC 3339: {e}"))
}
