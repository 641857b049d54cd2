//! tt - tabtrail CLI
//!
//! Records and replays workflows against page snapshots (`{"url", "root"}`
//! JSON files), running the same coordinator, page context and bus an
//! extension would. Results go to stdout as JSON, logs to stderr.

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use tabtrail::error::{Error, ErrorCode};
use tabtrail::prelude::*;

#[derive(Parser)]
#[command(name = "tt")]
#[command(about = "tabtrail - browser workflow recording and replay")]
#[command(version)]
struct Cli {
    /// Engine config (JSON); defaults apply to anything it leaves out
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Workflow store directory
    #[arg(long, global = true)]
    dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a scripted session against a page snapshot
    Record {
        #[arg(short, long, default_value = "workflow")]
        name: String,
        #[arg(long)]
        page: PathBuf,
        /// JSON list of user actions
        #[arg(long)]
        script: PathBuf,
    },
    /// Replay a sealed workflow against a page snapshot
    Replay {
        id: String,
        #[arg(long)]
        page: PathBuf,
    },
    /// List saved workflows
    List,
    /// Show a workflow
    Show {
        id: String,
        #[arg(long)]
        all: bool,
    },
    /// Delete a workflow
    Delete { id: String },
    /// Synthesize locators for a node of a page snapshot
    Synth {
        #[arg(long)]
        page: PathBuf,
        /// Pre-order node index (0 is the root element)
        #[arg(long)]
        node: usize,
    },
    /// Resolve one recorded step against a page snapshot
    Locate {
        id: String,
        index: u64,
        #[arg(long)]
        page: PathBuf,
    },
}

#[derive(Serialize)]
struct Output<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Error>,
}

impl<T: Serialize> Output<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(e: Error) -> Output<()> {
        Output {
            success: false,
            data: None,
            error: Some(e),
        }
    }
}

fn print_json<T: Serialize>(output: &T) {
    match serde_json::to_string_pretty(output) {
        Ok(s) => println!("{}", s),
        Err(e) => eprintln!("Error: cannot serialize output: {}", e),
    }
}

/// One scripted user action
#[derive(Debug, Deserialize)]
#[serde(tag = "do", rename_all = "kebab-case")]
enum ScriptStep {
    Click { target: Target },
    Type { target: Target, text: String },
    Change { target: Target, value: String },
    Blur { target: Target },
    Key {
        #[serde(default)]
        target: Option<Target>,
        key: String,
        #[serde(default)]
        modifiers: String,
    },
    Navigate {
        url: String,
        /// Snapshot of the page the URL loads; blank when absent
        #[serde(default)]
        page: Option<PathBuf>,
    },
    /// User think time; not recorded
    Wait { ms: u64 },
}

/// Element by `id` attribute, or by pre-order node index
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Target {
    Node(usize),
    Id(String),
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match load_config(cli.config.as_deref(), cli.dir.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            print_json(&Output::<()>::err(e));
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Record { name, page, script } => record(&config, &name, &page, &script),
        Commands::Replay { id, page } => replay(&config, &id, &page),
        Commands::List => list(&config),
        Commands::Show { id, all } => show(&config, &id, all),
        Commands::Delete { id } => delete(&config, &id),
        Commands::Synth { page, node } => synth(&config, &page, node),
        Commands::Locate { id, index, page } => locate(&config, &id, index, &page),
    };

    if let Err(e) = result {
        match e.downcast_ref::<Error>() {
            Some(err) => print_json(&Output::<()>::err(err.clone())),
            None => eprintln!("Error: {}", e),
        }
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>, dir: Option<&Path>) -> Result<EngineConfig, Error> {
    let mut config = match path {
        Some(p) => EngineConfig::load(p)?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = dir {
        config.storage.dir = Some(dir.to_path_buf());
    }
    Ok(config)
}

/// Ctrl+C flips the returned flag
fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let f = flag.clone();
    ctrlc::set_handler(move || {
        f.store(true, Ordering::SeqCst);
    })?;
    Ok(flag)
}

fn resolve_target(page: &PageHandle, target: &Target) -> Result<NodeId, Error> {
    let doc = page.document().lock();
    let node = match target {
        Target::Node(i) => Some(NodeId(*i)).filter(|n| doc.is_attached(*n)),
        Target::Id(id) => doc.by_id(id),
    };
    node.ok_or_else(|| {
        Error::invalid_input(format!("script target {:?} is not on the page", target))
    })
}

fn perform(page: &PageHandle, step: &ScriptStep) -> Result<()> {
    match step {
        ScriptStep::Click { target } => page.click(resolve_target(page, target)?)?,
        ScriptStep::Type { target, text } => page.type_text(resolve_target(page, target)?, text)?,
        ScriptStep::Change { target, value } => page.change(resolve_target(page, target)?, value)?,
        ScriptStep::Blur { target } => page.blur(resolve_target(page, target)?)?,
        ScriptStep::Key { target, key, modifiers } => {
            let node = match target {
                Some(t) => resolve_target(page, t)?,
                None => page.document().lock().body(),
            };
            page.key(node, key, Modifiers::parse(modifiers))?
        }
        ScriptStep::Navigate { url, page: snapshot } => {
            let root = match snapshot {
                Some(path) => PageSnapshot::load(path)?.root,
                None => Element::new("html").child(Element::new("body")),
            };
            page.navigate(url, &root)?
        }
        ScriptStep::Wait { ms } => std::thread::sleep(Duration::from_millis(*ms)),
    }
    Ok(())
}

fn record(config: &EngineConfig, name: &str, page_path: &Path, script_path: &Path) -> Result<()> {
    let snapshot = PageSnapshot::load(page_path)?;
    let script: Vec<ScriptStep> = serde_json::from_str(&std::fs::read_to_string(script_path)?)?;
    let interrupted = interrupt_flag()?;

    let bus = Bus::new(config.bus.clone());
    let coordinator = Coordinator::open(&bus, config.clone())?.spawn()?;
    for sealed in &coordinator.recovery().sealed {
        eprintln!("Recovered interrupted recording: {} ({} steps)", sealed.id, sealed.steps);
    }

    let tab = TabId(1);
    let doc = snapshot.to_document().into_shared();
    let driver = DocumentDriver::new(doc.clone()).page(&snapshot.url, snapshot.root.clone());
    let page = PageAgent::spawn(&bus, tab, doc, driver, config)?;
    let panel = PanelClient::attach(&bus, "cli");

    panel.start_record(tab, name, &origin_of(&snapshot.url))?;
    eprintln!("Recording: {} ({} scripted actions)", name, script.len());
    for step in &script {
        if interrupted.load(Ordering::SeqCst) {
            eprintln!("Interrupted, stopping early");
            break;
        }
        tracing::debug!(?step, "performing");
        perform(&page, step)?;
    }

    let session = panel.stop(tab)?;
    page.close();
    coordinator.shutdown();
    print_json(&Output::ok(session));
    Ok(())
}

fn replay(config: &EngineConfig, id: &str, page_path: &Path) -> Result<()> {
    let store = WorkflowStore::open(&config.storage)?;
    let stored = store.load_stored(id)?;
    if !stored.sealed {
        return Err(Error::invalid_state(format!("workflow {} is still being recorded", id)).into());
    }
    let snapshot = PageSnapshot::load(page_path)?;
    let interrupted = interrupt_flag()?;

    let doc = snapshot.to_document().into_shared();
    let driver = DocumentDriver::new(doc.clone()).page(&snapshot.url, snapshot.root.clone());
    let mut replayer = Replayer::new(doc.clone(), driver).config(config.replay.clone());
    eprintln!("Replaying {} ({} steps)...", stored.workflow.name, stored.workflow.steps.len());

    let report = replayer.play(&stored.workflow, &interrupted);
    let page = doc.lock().page_snapshot();
    let succeeded = report.succeeded();
    print_json(&Output::ok(serde_json::json!({ "report": report, "page": page })));
    if !succeeded {
        std::process::exit(2);
    }
    Ok(())
}

fn list(config: &EngineConfig) -> Result<()> {
    let store = WorkflowStore::open(&config.storage)?;
    print_json(&Output::ok(store.list()?));
    Ok(())
}

fn show(config: &EngineConfig, id: &str, all: bool) -> Result<()> {
    let store = WorkflowStore::open(&config.storage)?;
    let stored = store.load_stored(id)?;
    let data = if all {
        serde_json::json!({ "summary": stored.summary(), "steps": stored.workflow.steps })
    } else {
        let steps: Vec<String> = stored.workflow.steps.iter().map(|s| s.describe()).collect();
        serde_json::json!({ "summary": stored.summary(), "steps": steps })
    };
    print_json(&Output::ok(data));
    Ok(())
}

fn delete(config: &EngineConfig, id: &str) -> Result<()> {
    let store = WorkflowStore::open(&config.storage)?;
    store.delete(id)?;
    print_json(&Output::ok(serde_json::json!({ "deleted": id })));
    Ok(())
}

fn synth(config: &EngineConfig, page_path: &Path, node: usize) -> Result<()> {
    let doc = PageSnapshot::load(page_path)?.to_document();
    let node = NodeId(node);
    if !doc.is_attached(node) {
        return Err(
            Error::new(ErrorCode::InvalidInput, format!("no node {} on the page", node)).into(),
        );
    }
    let locators = Synthesizer::new(config.synth.clone()).synthesize(&doc, node);
    let out: Vec<_> = locators
        .iter()
        .map(|l| serde_json::json!({ "selector": l.to_string(), "locator": l }))
        .collect();
    print_json(&Output::ok(out));
    Ok(())
}

fn locate(config: &EngineConfig, id: &str, index: u64, page_path: &Path) -> Result<()> {
    let store = WorkflowStore::open(&config.storage)?;
    let workflow = store.load(id)?;
    let step = workflow
        .step(index)
        .ok_or_else(|| Error::invalid_input(format!("workflow {} has no step {}", id, index)))?;
    let doc = PageSnapshot::load(page_path)?.to_document();
    let resolved = Locator::new(step.locators.clone()).find(&doc)?;
    print_json(&Output::ok(serde_json::json!({
        "node": resolved.node,
        "locator_index": resolved.locator_index,
        "locator": step.locators[resolved.locator_index].to_string(),
        "tag": doc.tag(resolved.node),
    })));
    Ok(())
}
