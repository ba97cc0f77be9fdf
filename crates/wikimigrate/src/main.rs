use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use wikimigrate_core::attachments::AttachmentIndex;
use wikimigrate_core::config::{DEFAULT_CONFIG_FILENAME, MigrationConfig, load_config};
use wikimigrate_core::confluence::{ConfluenceClient, ConfluenceClientConfig};
use wikimigrate_core::local::render_tree;
use wikimigrate_core::publish::{PublishOptions, PublishReport, delete_remote_page, publish_tree};
use wikimigrate_core::transform::Transformer;
use wikimigrate_core::tree::{PageTree, parse_tree};
use wikimigrate_core::validate::{
    DuplicateRecord, fix_names, load_fixes, load_validation_state, save_fixes,
    save_validation_state, validate_tree,
};

#[derive(Debug, Parser)]
#[command(
    name = "wikimigrate",
    version,
    about = "Azure DevOps Wiki to Confluence migration CLI"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    wiki_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    output: Option<PathBuf>,
    #[arg(long, global = true, help = "Raise log level to debug")]
    debug: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Migrate(MigrateArgs),
    Validate,
    #[command(name = "fix-names")]
    FixNames,
    Local,
    Delete(DeleteArgs),
}

#[derive(Debug, Args)]
struct MigrateArgs {
    #[arg(long, value_name = "PAGE", help = "Publish only this page and its children")]
    single: Option<String>,
    #[arg(long, value_name = "ID", help = "Override the configured root parent page id")]
    parent: Option<String>,
    #[arg(long, help = "Report intended actions without mutating the target")]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DeleteArgs {
    id: String,
    #[arg(long, help = "Delete child pages first")]
    recursive: bool,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    config: Option<PathBuf>,
    wiki_dir: Option<PathBuf>,
    output: Option<PathBuf>,
    debug: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            config: cli.config.clone(),
            wiki_dir: cli.wiki_dir.clone(),
            output: cli.output.clone(),
            debug: cli.debug,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    env_logger::Builder::from_env(
        env_logger::Env::default()
            .default_filter_or(if runtime.debug { "debug" } else { "info" }),
    )
    .init();

    match cli.command {
        Some(Commands::Migrate(args)) => run_migrate(&runtime, args),
        Some(Commands::Validate) => run_validate(&runtime),
        Some(Commands::FixNames) => run_fix_names(&runtime),
        Some(Commands::Local) => run_local(&runtime),
        Some(Commands::Delete(args)) => run_delete(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn run_migrate(runtime: &RuntimeOptions, args: MigrateArgs) -> Result<()> {
    let (config, wiki_root) = resolve_config(runtime)?;
    let space_key = config.space_key()?;
    let (tree, index, fixes) = load_wiki(&config, &wiki_root)?;

    let client_config = ConfluenceClientConfig::from_config(&config)?;
    let transformer = Transformer::new(&client_config.base_url);
    let mut api = ConfluenceClient::new(client_config)?;

    // Validation gates publication: a dirty conflict queue means titles would
    // collide mid-publish, so halt before any mutation.
    let validation = validate_tree(&tree, &fixes, &space_key, &mut api)?;
    save_validation_state(&config.validation_state_path(&wiki_root), &validation.conflicts)?;
    if !validation.conflicts.is_empty() {
        print_conflicts(&validation.conflicts);
        bail!(
            "{} title conflicts detected; run `wikimigrate fix-names` and retry",
            validation.conflicts.len()
        );
    }

    let options = PublishOptions {
        space_key,
        root_parent_id: args.parent.or_else(|| config.root_parent_id()),
        single: args.single,
        dry_run: args.dry_run,
        ..PublishOptions::default()
    };
    let report = publish_tree(&tree, &index, &transformer, &fixes, &options, &mut api)?;
    print_publish_report(&report);
    if runtime.debug {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    if !report.success {
        bail!("migration finished with {} errors", report.errors.len());
    }
    Ok(())
}

fn run_validate(runtime: &RuntimeOptions) -> Result<()> {
    let (config, wiki_root) = resolve_config(runtime)?;
    let space_key = config.space_key()?;
    let (tree, _index, fixes) = load_wiki(&config, &wiki_root)?;

    let mut api = ConfluenceClient::new(ConfluenceClientConfig::from_config(&config)?)?;
    let report = validate_tree(&tree, &fixes, &space_key, &mut api)?;
    save_validation_state(&config.validation_state_path(&wiki_root), &report.conflicts)?;

    println!("validate");
    println!("pages_checked: {}", report.pages_checked);
    println!("conflicts: {}", report.conflicts.len());
    println!("request_count: {}", report.request_count);
    print_conflicts(&report.conflicts);
    if runtime.debug {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    if !report.conflicts.is_empty() {
        bail!("{} title conflicts remain", report.conflicts.len());
    }
    Ok(())
}

fn run_fix_names(runtime: &RuntimeOptions) -> Result<()> {
    let (config, wiki_root) = resolve_config(runtime)?;
    let project_name = config.project_name()?;
    let state_path = config.validation_state_path(&wiki_root);
    let fixes_path = config.name_fixes_path(&wiki_root);

    let queue = load_validation_state(&state_path)?;
    let mut fixes = load_fixes(&fixes_path)?;
    let report = fix_names(&queue, &mut fixes, &project_name);
    save_fixes(&fixes_path, &fixes)?;
    save_validation_state(&state_path, &[])?;

    println!("fix-names");
    println!("queued_conflicts: {}", queue.len());
    println!("fixed: {}", report.fixed.len());
    println!("already_fixed: {}", report.already_fixed);
    for (old, new) in &report.fixed {
        println!("renamed: {old} -> {new}");
    }
    Ok(())
}

fn run_local(runtime: &RuntimeOptions) -> Result<()> {
    let (config, wiki_root) = resolve_config(runtime)?;
    let (mut tree, index, fixes) = load_wiki(&config, &wiki_root)?;
    tree.apply_fixes(&fixes);

    // Preview needs no credentials; with no base URL configured, no cross-page
    // link can resolve to a remote id anyway.
    let base_url = config.base_url().unwrap_or_default();
    let transformer = Transformer::new(&base_url);
    let output_dir = runtime
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from("wiki-preview"));

    let report = render_tree(&tree, &index, &transformer, &output_dir)?;
    println!("local");
    println!("pages_rendered: {}", report.pages_rendered);
    println!("output_dir: {}", report.output_dir.display());
    println!("broken_links: {}", report.broken_links.len());
    for link in &report.broken_links {
        println!("broken_link: {link}");
    }
    println!("missing_attachments: {}", report.missing_attachments.len());
    for name in &report.missing_attachments {
        println!("missing_attachment: {name}");
    }
    Ok(())
}

fn run_delete(runtime: &RuntimeOptions, args: DeleteArgs) -> Result<()> {
    let (config, _wiki_root) = resolve_config(runtime)?;
    let mut api = ConfluenceClient::new(ConfluenceClientConfig::from_config(&config)?)?;

    let report = delete_remote_page(&args.id, args.recursive, &mut api)?;
    println!("delete");
    println!("deleted: {}", report.deleted);
    println!("request_count: {}", report.request_count);
    if !report.errors.is_empty() {
        for error in &report.errors {
            println!("error: {error}");
        }
        bail!("delete finished with {} errors", report.errors.len());
    }
    Ok(())
}

fn resolve_config(runtime: &RuntimeOptions) -> Result<(MigrationConfig, PathBuf)> {
    dotenvy::dotenv().ok();

    let config_path = runtime
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILENAME));
    let config = load_config(&config_path)?;
    let wiki_root = config.wiki_root(runtime.wiki_dir.as_deref())?;

    // A .env beside the wiki takes precedence over the process environment.
    let wiki_env = wiki_root.join(".env");
    if wiki_env.exists() {
        let _ = dotenvy::from_path_override(&wiki_env);
    }

    Ok((config, wiki_root))
}

fn load_wiki(
    config: &MigrationConfig,
    wiki_root: &Path,
) -> Result<(
    PageTree,
    AttachmentIndex,
    std::collections::BTreeMap<String, String>,
)> {
    let tree = parse_tree(wiki_root)
        .with_context(|| format!("failed to parse wiki tree at {}", wiki_root.display()))?;
    let index = AttachmentIndex::build(&tree.attachment_dirs)?;
    let fixes = load_fixes(&config.name_fixes_path(wiki_root))?;

    println!("wiki_root: {}", wiki_root.display());
    println!("pages: {}", tree.page_count());
    println!("attachments: {}", index.len());
    Ok((tree, index, fixes))
}

fn print_conflicts(conflicts: &[DuplicateRecord]) {
    for conflict in conflicts {
        match &conflict.remote_id {
            Some(id) => println!(
                "conflict: {} ({}, remote id {id})",
                conflict.title,
                conflict.reason.as_str()
            ),
            None => println!(
                "conflict: {} ({}) at {}",
                conflict.title,
                conflict.reason.as_str(),
                conflict.path
            ),
        }
    }
}

fn print_publish_report(report: &PublishReport) {
    println!("migrate");
    println!("success: {}", report.success);
    println!("dry_run: {}", report.dry_run);
    println!("placeholders_created: {}", report.placeholders_created);
    println!("updated: {}", report.updated);
    println!("skipped: {}", report.skipped);
    println!("attachments_uploaded: {}", report.attachments_uploaded);
    println!("attachments_skipped: {}", report.attachments_skipped);
    println!("request_count: {}", report.request_count);
    for link in &report.broken_links {
        println!("broken_link: {link}");
    }
    for error in &report.errors {
        println!("error: {error}");
    }
}
