use anyhow::{bail, Context, Result};
use clap::Parser;
use query_builder::cancel::CancellationToken;
use query_builder::config::EngineConfig;
use query_builder::generation::{Enhancement, StructuredFilter};
use query_builder::logging::init_tracing;
use query_builder::service::{FragmentQueryRequest, QueryBuilderService, ViewQueryRequest};
use query_builder::validator::QueryMode;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "query-builder")]
#[command(about = "Natural-language to SQL query builder for school district reporting")]
struct Args {
    /// The request in natural language
    prompt: String,

    /// Composition mode: fragment or view
    #[arg(short, long, default_value = "fragment")]
    mode: QueryMode,

    /// Fragment registry JSON (overrides FRAGMENTS_PATH)
    #[arg(long)]
    fragments: Option<PathBuf>,

    /// View catalog JSON (overrides VIEW_CATALOG_PATH)
    #[arg(long)]
    views: Option<PathBuf>,

    /// Structured filter as field=value[,value...]; repeatable
    #[arg(long = "filter")]
    filters: Vec<String>,

    /// Fragment id to select up front; repeatable
    #[arg(long = "fragment")]
    seed_fragments: Vec<String>,

    /// Additional data to include (LEFT JOINed); repeatable
    #[arg(long = "include")]
    includes: Vec<String>,

    /// Results will be paged
    #[arg(long)]
    paginate: bool,

    /// Run the generated SQL (view mode, needs DATABASE_URL)
    #[arg(long)]
    execute: bool,

    /// Include the attempt trace in the output
    #[arg(long)]
    debug: bool,
}

fn parse_filter(raw: &str) -> Result<StructuredFilter> {
    let Some((field, values)) = raw.split_once('=') else {
        bail!("Filter '{}' must look like field=value", raw);
    };
    Ok(StructuredFilter {
        field: field.trim().to_string(),
        values: values
            .split(',')
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect(),
        ..Default::default()
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info");

    let args = Args::parse();
    let mut config = EngineConfig::from_env()?;
    if args.fragments.is_some() {
        config.fragments_path = args.fragments.clone();
    }
    if args.views.is_some() {
        config.view_catalog_path = args.views.clone();
    }

    info!("Query builder starting ({} mode)", args.mode);
    let service = QueryBuilderService::from_config(&config)
        .await
        .context("Failed to initialise query builder")?;

    let mut filters = args
        .filters
        .iter()
        .map(|f| parse_filter(f))
        .collect::<Result<Vec<_>>>()?;
    filters.extend(args.seed_fragments.iter().map(|id| StructuredFilter {
        field: "fragment".to_string(),
        fragment_id: Some(id.clone()),
        ..Default::default()
    }));
    let enhancements: Vec<Enhancement> = args
        .includes
        .iter()
        .map(|label| Enhancement {
            label: label.clone(),
            ..Default::default()
        })
        .collect();

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let (status, body) = match args.mode {
        QueryMode::Fragment => {
            let request = FragmentQueryRequest {
                prompt: args.prompt.clone(),
                filters,
                enhancements,
                paginate: args.paginate,
            };
            let (status, response) = service.respond_fragment(&request, &cancel).await;
            let response = if args.debug { response } else { response.without_debug_info() };
            (status, serde_json::to_string_pretty(&response)?)
        }
        QueryMode::View => {
            let request = ViewQueryRequest {
                prompt: args.prompt.clone(),
                execute: args.execute,
                filters,
                enhancements,
                paginate: args.paginate,
            };
            let (status, response) = service.respond_view(&request, &cancel).await;
            let response = if args.debug { response } else { response.without_debug_info() };
            (status, serde_json::to_string_pretty(&response)?)
        }
    };

    println!("{}", body);
    if status != 200 {
        std::process::exit(1);
    }
    Ok(())
}
