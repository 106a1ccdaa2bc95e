//! Codebook CLI: candidate governance for a qualitative-research codebook.
//!
//! Usage:
//!   codebook candidate <subcommand> [--project name] [--db path]
//!   codebook merge <subcommand> --memo text [--yes]
//!   codebook plan <subcommand> [--scores table.yaml]

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use codebook::api::{CodebookApi, Refreshed};
use codebook::config::EngineConfig;
use codebook::reconcile::{
    AutoConfirm, BatchConfirmation, MergeBatchOutcome, MergePair, MergeStrategy, PromotionSelection,
};
use codebook::storage::{CandidateFilter, SortOrder};
use codebook::{CandidateId, CandidateState, CodeOrigin, DisabledGraphSync, Fragment, NewCandidate, OpenStore};
use codebook::{SqliteStore, TableOracle};
use serde::Serialize;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "codebook",
    version,
    about = "Candidate code lifecycle and merge reconciliation"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Project the command operates on
    #[arg(long, short, global = true, default_value = "default")]
    project: String,
    /// Path to SQLite database file
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Path to config YAML
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// YAML table of pairwise similarity scores
    #[arg(long, global = true)]
    scores: Option<PathBuf>,
    /// Skip merge confirmation prompts
    #[arg(long, short, global = true)]
    yes: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage candidate codes
    Candidate {
        #[command(subcommand)]
        action: CandidateAction,
    },
    /// Register evidence fragments
    Fragment {
        #[command(subcommand)]
        action: FragmentAction,
    },
    /// Merge candidates into surviving codes
    Merge {
        #[command(subcommand)]
        action: MergeAction,
    },
    /// Find duplicate codes
    Duplicates {
        #[command(subcommand)]
        action: DuplicatesAction,
    },
    /// AI merge plans
    Plan {
        #[command(subcommand)]
        action: PlanAction,
    },
    /// Promote validated candidates into the codebook
    Promote {
        /// Candidate ids; all validated candidates when omitted
        ids: Vec<String>,
    },
    /// Show backlog health
    Health,
    /// List the canonical codebook
    Codebook,
    /// Synchronize the codebook with the external graph
    Sync,
    /// Show the audit trail
    Audit {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum CandidateAction {
    /// Add candidate codes in `pendiente`
    Add {
        #[arg(required = true)]
        codes: Vec<String>,
        #[arg(long, default_value = "manual")]
        origin: CodeOrigin,
        /// Evidence fragment id
        #[arg(long)]
        fragment: Option<String>,
        #[arg(long)]
        quote: Option<String>,
        #[arg(long)]
        document: Option<String>,
        #[arg(long)]
        confidence: Option<f32>,
    },
    /// List candidates
    List {
        #[arg(long)]
        state: Vec<CandidateState>,
        #[arg(long)]
        origin: Option<CodeOrigin>,
        /// Only promoted (true) or unpromoted (false) rows
        #[arg(long)]
        promoted: Option<bool>,
        #[arg(long, default_value = "newest")]
        sort: SortOrder,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Validate a candidate
    Validate { id: String },
    /// Reject a candidate
    Reject {
        id: String,
        #[arg(long)]
        memo: Option<String>,
    },
    /// Park a candidate as a hypothesis
    Hypothesis {
        id: String,
        #[arg(long)]
        memo: Option<String>,
    },
    /// Move every validated candidate back to pending
    Revert {
        #[arg(long)]
        memo: String,
    },
}

#[derive(Subcommand)]
enum FragmentAction {
    /// Register a fragment
    Add {
        id: String,
        text: String,
        #[arg(long, default_value = "")]
        document: String,
    },
}

#[derive(Subcommand)]
enum MergeAction {
    /// Merge candidate ids into a target code
    Ids {
        #[arg(required = true)]
        ids: Vec<String>,
        #[arg(long)]
        into: String,
        #[arg(long)]
        memo: String,
    },
    /// Merge explicit pairs given as SOURCE=>TARGET
    Pairs {
        #[arg(long = "pair", required = true, value_parser = parse_pair)]
        pairs: Vec<MergePair>,
        #[arg(long)]
        memo: String,
        #[arg(long, default_value = "as_given")]
        strategy: MergeStrategy,
    },
    /// Merge every pair the backlog scan finds, shorter label wins
    Auto {
        #[arg(long)]
        threshold: Option<f32>,
        #[arg(long)]
        memo: String,
    },
}

#[derive(Subcommand)]
enum DuplicatesAction {
    /// Scan the backlog for near duplicates
    Detect {
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// Check proposed codes before adding them
    Check {
        #[arg(required = true)]
        codes: Vec<String>,
        #[arg(long)]
        threshold: Option<f32>,
        /// Merge flagged codes, using this memo
        #[arg(long)]
        merge_memo: Option<String>,
        /// Destination for flagged codes; top suggestion when omitted
        #[arg(long)]
        into: Option<String>,
    },
}

#[derive(Subcommand)]
enum PlanAction {
    /// Create a merge plan over the backlog or the given codes
    Create {
        codes: Vec<String>,
        #[arg(long)]
        threshold: Option<f32>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show a plan and its pending pairs
    Show { run_id: String },
    /// Apply one pending pair
    Apply {
        run_id: String,
        source: String,
        target: String,
        #[arg(long)]
        memo: Option<String>,
    },
    /// Reject one pending pair
    Reject {
        run_id: String,
        source: String,
        target: String,
        #[arg(long)]
        memo: Option<String>,
    },
}

fn parse_pair(s: &str) -> Result<MergePair, String> {
    let (source, target) = s
        .split_once("=>")
        .ok_or_else(|| format!("expected SOURCE=>TARGET, got '{}'", s))?;
    let (source, target) = (source.trim(), target.trim());
    if source.is_empty() || target.is_empty() {
        return Err(format!("expected SOURCE=>TARGET, got '{}'", s));
    }
    Ok(MergePair::new(source, target))
}

/// Asks on stdin before each merge batch.
struct PromptConfirm;

#[async_trait]
impl BatchConfirmation for PromptConfirm {
    async fn confirm(&self, project: &str, pairs: &[MergePair]) -> bool {
        eprintln!("About to merge {} pair(s) in project '{}':", pairs.len(), project);
        for pair in pairs {
            eprintln!("  {}", pair);
        }
        eprint!("Proceed? [y/N] ");
        std::io::stderr().flush().ok();
        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_lowercase().as_str(), "y" | "yes" | "s" | "si" | "sí")
    }
}

fn open_api(cli: &Cli, config: EngineConfig) -> Result<CodebookApi, String> {
    let db_path = cli.db.clone().unwrap_or_else(|| config.database_path());
    let store = SqliteStore::open(&db_path).map_err(|e| format!("Failed to open database: {}", e))?;

    let oracle = match &cli.scores {
        Some(path) => TableOracle::from_yaml(path).map_err(|e| e.to_string())?,
        None => {
            tracing::debug!("no score table given; only identical codes will match");
            TableOracle::new()
        }
    };

    let confirmation: Arc<dyn BatchConfirmation> = if cli.yes {
        Arc::new(AutoConfirm)
    } else {
        Arc::new(PromptConfirm)
    };

    Ok(CodebookApi::with_confirmation(
        Arc::new(store),
        Arc::new(oracle),
        Arc::new(DisabledGraphSync),
        config,
        confirmation,
    ))
}

fn fail(e: impl std::fmt::Display) -> i32 {
    eprintln!("Error: {}", e);
    1
}

fn print_json<T: Serialize>(value: &T) -> i32 {
    match serde_json::to_string_pretty(value) {
        Ok(text) => {
            println!("{}", text);
            0
        }
        Err(e) => fail(e),
    }
}

fn print_health<T>(refreshed: &Refreshed<T>) {
    let health = &refreshed.health;
    if !health.is_healthy {
        for alert in &health.alerts {
            eprintln!("Warning: {}", alert);
        }
    }
}

fn print_batch(outcome: &MergeBatchOutcome) {
    match outcome {
        MergeBatchOutcome::Completed(report) => println!(
            "Merged {} row(s) across {} pair(s); {} self merge(s) and {} chained pair(s) skipped, {} failed",
            report.total_merged,
            report.pairs_processed,
            report.self_merges_skipped,
            report.chained_skipped,
            report.failed
        ),
        MergeBatchOutcome::Cancelled => println!("Merge cancelled; nothing changed"),
        MergeBatchOutcome::AlreadyRunning => println!("Another merge batch is running; nothing changed"),
    }
}

fn cmd_candidate_list(api: &CodebookApi, project: &str, filter: &CandidateFilter) -> i32 {
    let rows = match api.list_candidates(project, filter) {
        Ok(rows) => rows,
        Err(e) => return fail(e),
    };
    if rows.is_empty() {
        println!("No candidates.");
        return 0;
    }
    println!("{:<36}  {:<32}  {:<10}  {:<20}  {}", "ID", "CODIGO", "ESTADO", "ORIGEN", "FUSIONADO_A");
    println!("{}", "-".repeat(112));
    for row in rows {
        println!(
            "{:<36}  {:<32}  {:<10}  {:<20}  {}",
            row.id.as_str(),
            row.code,
            row.state.as_str(),
            row.origin.as_str(),
            row.merged_into.unwrap_or_default()
        );
    }
    0
}

async fn cmd_candidate(api: &CodebookApi, project: &str, action: CandidateAction) -> i32 {
    match action {
        CandidateAction::Add {
            codes,
            origin,
            fragment,
            quote,
            document,
            confidence,
        } => {
            let new: Vec<NewCandidate> = codes
                .iter()
                .map(|code| {
                    let mut candidate = NewCandidate::new(code.as_str(), origin);
                    if let Some(ref f) = fragment {
                        candidate = candidate.with_fragment(f.as_str());
                    }
                    if let Some(ref q) = quote {
                        candidate = candidate.with_quote(q.as_str());
                    }
                    if let Some(ref d) = document {
                        candidate = candidate.with_document(d.as_str());
                    }
                    if let Some(c) = confidence {
                        candidate = candidate.with_confidence(c);
                    }
                    candidate
                })
                .collect();
            match api.add_candidates(project, &new) {
                Ok(refreshed) => {
                    for row in &refreshed.outcome {
                        println!("Added '{}' ({})", row.code, row.id);
                    }
                    print_health(&refreshed);
                    0
                }
                Err(e) => fail(e),
            }
        }
        CandidateAction::List {
            state,
            origin,
            promoted,
            sort,
            limit,
            offset,
        } => {
            let mut filter = CandidateFilter::new().with_states(&state).sorted(sort).with_offset(offset);
            if let Some(origin) = origin {
                filter = filter.with_origin(origin);
            }
            if let Some(promoted) = promoted {
                filter = filter.promoted(promoted);
            }
            if let Some(limit) = limit {
                filter = filter.with_limit(limit);
            }
            cmd_candidate_list(api, project, &filter)
        }
        CandidateAction::Validate { id } => match api.validate(project, &CandidateId::from(id)) {
            Ok(refreshed) if !refreshed.outcome.changed => {
                println!("Candidate {} is already validated", refreshed.outcome.id);
                0
            }
            Ok(refreshed) => {
                println!("Validated {}", refreshed.outcome.id);
                print_health(&refreshed);
                0
            }
            Err(e) => fail(e),
        },
        CandidateAction::Reject { id, memo } => {
            match api.reject(project, &CandidateId::from(id), memo.as_deref()) {
                Ok(refreshed) => {
                    println!("Rejected {}", refreshed.outcome.id);
                    print_health(&refreshed);
                    0
                }
                Err(e) => fail(e),
            }
        }
        CandidateAction::Hypothesis { id, memo } => {
            match api.mark_hypothesis(project, &CandidateId::from(id), memo.as_deref()) {
                Ok(refreshed) => {
                    println!("Marked {} as hypothesis", refreshed.outcome.id);
                    print_health(&refreshed);
                    0
                }
                Err(e) => fail(e),
            }
        }
        CandidateAction::Revert { memo } => match api.revert_validated(project, &memo) {
            Ok(refreshed) => {
                println!("Reverted {} validated candidate(s) to pending", refreshed.outcome);
                print_health(&refreshed);
                0
            }
            Err(e) => fail(e),
        },
    }
}

async fn cmd_merge(api: &CodebookApi, project: &str, action: MergeAction) -> i32 {
    match action {
        MergeAction::Ids { ids, into, memo } => {
            let ids: Vec<CandidateId> = ids.into_iter().map(CandidateId::from).collect();
            match api.merge_candidates(project, &ids, &into, &memo) {
                Ok(refreshed) => {
                    println!(
                        "Merged {} candidate(s) into '{}'; {} already named '{}'",
                        refreshed.outcome.merged_count, into, refreshed.outcome.self_merges_skipped, into
                    );
                    print_health(&refreshed);
                    0
                }
                Err(e) => fail(e),
            }
        }
        MergeAction::Pairs { pairs, memo, strategy } => {
            match api.auto_merge_batch(project, pairs, &memo, strategy).await {
                Ok(refreshed) => {
                    print_batch(&refreshed.outcome);
                    print_health(&refreshed);
                    0
                }
                Err(e) => fail(e),
            }
        }
        MergeAction::Auto { threshold, memo } => {
            let report = match api.detect_duplicates(project, threshold).await {
                Ok(report) => report,
                Err(e) => return fail(e),
            };
            if report.pairs.is_empty() {
                println!("No similar pairs at or above {:.2}; nothing to merge", report.threshold);
                return 0;
            }
            let pairs = report
                .pairs
                .iter()
                .map(|p| MergePair::new(p.code1.clone(), p.code2.clone()).with_similarity(p.similarity))
                .collect();
            match api
                .auto_merge_batch(project, pairs, &memo, MergeStrategy::PreferShorter)
                .await
            {
                Ok(refreshed) => {
                    print_batch(&refreshed.outcome);
                    print_health(&refreshed);
                    0
                }
                Err(e) => fail(e),
            }
        }
    }
}

async fn cmd_duplicates(api: &CodebookApi, project: &str, action: DuplicatesAction) -> i32 {
    match action {
        DuplicatesAction::Detect { threshold } => match api.detect_duplicates(project, threshold).await {
            Ok(report) => print_json(&report),
            Err(e) => fail(e),
        },
        DuplicatesAction::Check {
            codes,
            threshold,
            merge_memo,
            into,
        } => {
            let results = match api.check_batch_codes(project, &codes, threshold).await {
                Ok(results) => results,
                Err(e) => return fail(e),
            };
            let code = print_json(&results);
            match merge_memo {
                Some(memo) => match api.merge_flagged(project, &results, into.as_deref(), &memo).await {
                    Ok(refreshed) => {
                        let report = &refreshed.outcome;
                        println!(
                            "Skipped {} without target, {} self merge(s), {} circular",
                            report.skipped_no_target, report.skipped_self_merge, report.skipped_cycle
                        );
                        if let Some(ref outcome) = report.outcome {
                            print_batch(outcome);
                        }
                        0
                    }
                    Err(e) => fail(e),
                },
                None => code,
            }
        }
    }
}

async fn cmd_plan(api: &CodebookApi, project: &str, action: PlanAction) -> i32 {
    match action {
        PlanAction::Create {
            codes,
            threshold,
            limit,
        } => {
            let codes = (!codes.is_empty()).then_some(codes);
            match api.plan_merges(project, codes.as_deref(), threshold, limit).await {
                Ok(plan) if plan.is_empty() => {
                    println!(
                        "No high-confidence pairs at or above {:.2}; nothing proposed (run {})",
                        plan.threshold, plan.run_id
                    );
                    0
                }
                Ok(plan) => print_json(&plan),
                Err(e) => fail(e),
            }
        }
        PlanAction::Show { run_id } => match api.get_plan(&run_id) {
            Ok(view) => print_json(&view),
            Err(e) => fail(e),
        },
        PlanAction::Apply {
            run_id,
            source,
            target,
            memo,
        } => match api.apply_plan_pair(project, &run_id, &source, &target, memo.as_deref()) {
            Ok(refreshed) => {
                println!("Applied '{}' -> '{}': {} row(s) merged", source, target, refreshed.outcome.merged);
                print_health(&refreshed);
                0
            }
            Err(e) => fail(e),
        },
        PlanAction::Reject {
            run_id,
            source,
            target,
            memo,
        } => match api.reject_plan_pair(project, &run_id, &source, &target, memo.as_deref()) {
            Ok(view) => {
                println!("Rejected '{}' -> '{}'; {} pair(s) pending", source, target, view.pending.len());
                0
            }
            Err(e) => fail(e),
        },
    }
}

async fn cmd_promote(api: &CodebookApi, project: &str, ids: Vec<String>) -> i32 {
    let selection = if ids.is_empty() {
        PromotionSelection::AllValidated
    } else {
        PromotionSelection::Ids(ids.into_iter().map(CandidateId::from).collect())
    };
    match api.promote(project, selection).await {
        Ok(refreshed) => {
            let report = &refreshed.outcome;
            println!(
                "Promoted {} of {} eligible; {} skipped without evidence",
                report.promoted_count, report.eligible_total, report.skipped_total
            );
            print_health(&refreshed);
            0
        }
        Err(e) => fail(e),
    }
}

async fn run(api: &CodebookApi, project: &str, command: Commands) -> i32 {
    match command {
        Commands::Candidate { action } => cmd_candidate(api, project, action).await,
        Commands::Fragment {
            action: FragmentAction::Add { id, text, document },
        } => {
            let fragment = Fragment {
                id,
                project: project.to_string(),
                document,
                text,
            };
            match api.add_fragment(&fragment) {
                Ok(()) => {
                    println!("Registered fragment {}", fragment.id);
                    0
                }
                Err(e) => fail(e),
            }
        }
        Commands::Merge { action } => cmd_merge(api, project, action).await,
        Commands::Duplicates { action } => cmd_duplicates(api, project, action).await,
        Commands::Plan { action } => cmd_plan(api, project, action).await,
        Commands::Promote { ids } => cmd_promote(api, project, ids).await,
        Commands::Health => match api.backlog_health(project) {
            Ok(snapshot) => print_json(&snapshot),
            Err(e) => fail(e),
        },
        Commands::Codebook => match api.codebook(project) {
            Ok(codes) if codes.is_empty() => {
                println!("Codebook is empty.");
                0
            }
            Ok(codes) => {
                for code in codes {
                    println!("{:<32}  {} candidate(s)", code.code, code.promoted_from.len());
                }
                0
            }
            Err(e) => fail(e),
        },
        Commands::Sync => match api.sync_external_graph(project).await {
            Ok(report) => print_json(&report),
            Err(e) => fail(e),
        },
        Commands::Audit { limit } => match api.audit_log(project, Some(limit)) {
            Ok(entries) => print_json(&entries),
            Err(e) => fail(e),
        },
    }
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "codebook=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = match EngineConfig::load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    let api = match open_api(&cli, config) {
        Ok(api) => api,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    let code = rt.block_on(run(&api, &cli.project, cli.command));
    std::process::exit(code);
}
