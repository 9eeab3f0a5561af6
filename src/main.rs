//! loo-agent CLI: leave-one-out attribution for LLM agent traces.

use std::path::PathBuf;

use clap::builder::PossibleValuesParser;
use clap::{CommandFactory, FromArgMatches, Parser};
use miette::Result;

use loo_agent::config::LooConfig;
use loo_agent::engine::{AttributionEngine, AttributionResult};
use loo_agent::error::{EngineError, EngineResult};
use loo_agent::oracle::{CandleOracle, LanguageModelOracle, registry};
use loo_agent::present::ResultPresenter;
use loo_agent::scenarios;
use loo_agent::trace::AgentTrace;

#[derive(Parser)]
#[command(
    name = "loo-agent",
    version,
    about = "Leave-one-out context attribution for LLM agents"
)]
struct Cli {
    /// Model key (see below), hub identifier, or local model directory.
    model: Option<String>,

    /// Config file. Defaults to $XDG_CONFIG_HOME/loo-agent/config.toml.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Hub revision (branch, tag or commit).
    #[arg(long)]
    revision: Option<String>,

    /// Run on CPU even when an accelerator is available.
    #[arg(long)]
    cpu: bool,

    /// Token limit for prompt + completion.
    #[arg(long, value_name = "TOKENS")]
    max_context: Option<usize>,

    /// Token limit for generated responses.
    #[arg(long, value_name = "TOKENS")]
    max_new_tokens: Option<usize>,

    /// Retries for a failed model call.
    #[arg(long)]
    retries: Option<u32>,

    /// Wall-clock budget per attribution, in seconds.
    #[arg(long, value_name = "SECS")]
    budget_secs: Option<f64>,

    /// Score ablations in parallel.
    #[arg(long)]
    parallel: bool,

    /// Plain-text output without colour or tables.
    #[arg(long)]
    plain: bool,

    /// Built-in scenario to run (repeatable). Defaults to all.
    #[arg(
        long = "scenario",
        value_name = "KEY",
        value_parser = PossibleValuesParser::new(scenarios::KEYS.iter().copied()),
        conflicts_with = "trace"
    )]
    scenarios: Vec<String>,

    /// Explain a trace from a JSON file instead of the built-in scenarios.
    #[arg(long, value_name = "FILE")]
    trace: Option<PathBuf>,

    /// Also explain the tool call at this index of the trace.
    #[arg(long, requires = "trace")]
    tool_index: Option<usize>,

    /// Explain this response instead of generating one.
    #[arg(long, requires = "trace")]
    response: Option<String>,
}

impl Cli {
    /// Apply flags on top of file configuration.
    fn apply(&self, config: &mut LooConfig) {
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if self.revision.is_some() {
            config.revision = self.revision.clone();
        }
        if self.cpu {
            config.cpu = true;
        }
        if let Some(n) = self.max_context {
            config.max_context = n;
        }
        if let Some(n) = self.max_new_tokens {
            config.max_new_tokens = n;
        }
        if let Some(n) = self.retries {
            config.retries = n;
        }
        if self.budget_secs.is_some() {
            config.budget_secs = self.budget_secs;
        }
        if self.parallel {
            config.parallel = true;
        }
        if self.plain {
            config.plain = true;
        }
    }
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let matches = Cli::command().after_help(registry::listing()).get_matches();
    let cli = Cli::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());

    let mut config = LooConfig::discover(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    let presenter = ResultPresenter::new(config.plain);
    let oracle = CandleOracle::load(&config.oracle_config())?;
    config.check_context(oracle.max_context())?;
    let engine = AttributionEngine::new(&oracle, config.engine_config()?);

    println!("LOO Attribution: retrieval and APIs are both tools");
    println!("Model: {}", oracle.model_id());

    let mut incomplete = 0usize;
    let mut report = |title: &str, outcome: EngineResult<AttributionResult>| -> Result<()> {
        match outcome {
            Ok(result) => println!("{}", presenter.render(title, &result)),
            Err(EngineError::Partial(partial)) => {
                println!("{}", presenter.render_partial(title, &partial));
                incomplete += 1;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    };

    if let Some(path) = &cli.trace {
        let trace = AgentTrace::load(path)?;
        if let Some(index) = cli.tool_index {
            let title = match trace.tool(index) {
                Some(tool) => format!("Why call {}?", tool.name()),
                None => format!("Why call tool {index}?"),
            };
            report(title.as_str(), engine.attribute_tool_selection(&trace, index))?;
        }
        report(
            "What informed the response?",
            engine.attribute_response(&trace, cli.response.as_deref()),
        )?;
    } else {
        let selected = if cli.scenarios.is_empty() {
            scenarios::all()?
        } else {
            let mut selected = Vec::with_capacity(cli.scenarios.len());
            for key in &cli.scenarios {
                if let Some(scenario) = scenarios::by_key(key)? {
                    selected.push(scenario);
                }
            }
            selected
        };

        for (n, scenario) in selected.iter().enumerate() {
            println!(
                "\n━━ Scenario {}: {} ({}) ━━",
                n + 1,
                scenario.title,
                scenario.summary
            );
            if let (Some(index), Some(title)) = (scenario.tool_target, scenario.tool_question()) {
                report(title.as_str(), engine.attribute_tool_selection(&scenario.trace, index))?;
            }
            report(
                "What informed the response?",
                engine.attribute_response(&scenario.trace, None),
            )?;
        }
    }

    if incomplete > 0 {
        return Err(miette::miette!(
            help = "Rerun with a larger --budget-secs or check the model logs above.",
            "{incomplete} attribution(s) were incomplete"
        ));
    }
    Ok(())
}
