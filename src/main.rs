use std::{io::Write, sync::Arc};

use clap::Parser;
use docrag::{
    DataDir, DocumentLoader, Error, IndexManager, IndexingPipeline, RagClient,
    RagConfig, RedbVectorStore, Reranker, Result, SearchResult, TextChunker,
    embedding::{check_embedder, embedder_from_config},
    item_id::short_id,
    reranker::scorer_from_config,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, CollectionAction, Command, IndexArgs, SearchArgs};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("DOCRAG_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

/// A token that is cancelled on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, finishing current step");
            child.cancel();
        }
    });
    token
}

/// Everything a command needs, opened once.
struct Context {
    data_dir: DataDir,
    config: RagConfig,
    index: IndexManager,
}

impl Context {
    fn open(cli: &Cli) -> Result<Self> {
        let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
        let config =
            RagConfig::load(cli.config.as_deref(), &data_dir.config_file())?;
        let store =
            RedbVectorStore::open(&data_dir.vectors_db(), config.store.metric)?;
        Ok(Self {
            data_dir,
            config,
            index: IndexManager::new(Arc::new(store)),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let ctx = Context::open(&cli)?;
    match cli.command {
        Command::Index(args) => cmd_index(&ctx, &args).await?,
        Command::Search(args) => cmd_search(&ctx, &args).await?,
        Command::Collection { action } => match action {
            CollectionAction::List { json } => collection_list(&ctx, json).await?,
            CollectionAction::Remove { name } => {
                collection_remove(&ctx, &name).await?;
            }
            CollectionAction::Clear { yes } => collection_clear(&ctx, yes).await?,
        },
        Command::Stats(args) => cmd_stats(&ctx, args.json).await?,
        Command::Completions(_) => {}
    }

    Ok(())
}

async fn cmd_index(ctx: &Context, args: &IndexArgs) -> Result<()> {
    check_embedder(&ctx.config.embedding).await?;
    let embedder = embedder_from_config(&ctx.config.embedding)?;
    let pipeline = IndexingPipeline::new(
        DocumentLoader::new(),
        TextChunker::new(ctx.config.chunking)?,
        embedder,
        ctx.index.clone(),
    );

    let cancel = cancel_on_ctrl_c();
    let report = pipeline
        .index_path(&args.path, args.collection.as_deref(), &cancel)
        .await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Collection: {}", report.collection);
        println!("Documents loaded: {}", report.documents_loaded);
        println!("Chunks created: {}", report.chunks_created);
        println!("Embeddings generated: {}", report.embeddings_generated);
        println!("Items indexed: {}", report.items_indexed);
        if report.embeddings_dropped > 0 {
            println!("Chunks without embeddings: {}", report.embeddings_dropped);
        }
        for skipped in &report.skipped {
            println!("  skipped {}: {}", skipped.source, skipped.reason);
        }
    }

    match report.error_message {
        Some(message) if !report.success => Err(Error::Indexing(message)),
        _ => Ok(()),
    }
}

#[derive(Serialize)]
struct SearchOutput<'a> {
    query: &'a str,
    result_count: usize,
    results: &'a [SearchResult],
}

async fn cmd_search(ctx: &Context, args: &SearchArgs) -> Result<()> {
    let top_k = args.count.unwrap_or(ctx.config.search.top_k);
    let initial_k = args.initial_k.unwrap_or(ctx.config.search.initial_k);
    check_embedder(&ctx.config.embedding).await?;
    let embedder = embedder_from_config(&ctx.config.embedding)?;

    let results = if args.no_rerank {
        let pipeline = IndexingPipeline::new(
            DocumentLoader::new(),
            TextChunker::new(ctx.config.chunking)?,
            embedder,
            ctx.index.clone(),
        );
        pipeline
            .search(&args.query, args.collection.as_deref(), top_k, None)
            .await?
    } else {
        let scorer = scorer_from_config(&ctx.config.scoring)?;
        let reranker = Reranker::new(scorer, ctx.config.rerank.clone());
        let client = RagClient::new(embedder, ctx.index.clone(), reranker);
        let cancel = cancel_on_ctrl_c();
        client
            .search(
                &args.query,
                args.collection.as_deref(),
                top_k,
                initial_k,
                &cancel,
            )
            .await?
    };

    if args.json {
        let output = SearchOutput {
            query: &args.query,
            result_count: results.len(),
            results: &results,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        format_human(&results);
    }
    Ok(())
}

fn format_human(results: &[SearchResult]) {
    if results.is_empty() {
        println!("No relevant results found.");
        return;
    }

    for (i, r) in results.iter().enumerate() {
        let score = r
            .rerank_score
            .map(|s| format!("{s:.1}"))
            .unwrap_or_else(|| "-".into());
        println!(
            "{:>3}. [score {score}, distance {:.3}] {}:{} #{}",
            i + 1,
            r.distance,
            r.collection,
            r.source,
            short_id(&r.id)
        );
        let preview: String = r.text.chars().take(160).collect();
        println!("     {}", preview.replace('\n', " ").trim());
    }
    println!("\n{} result(s)", results.len());
}

async fn collection_list(ctx: &Context, json: bool) -> Result<()> {
    let collections = ctx.index.list_collections().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&collections)?);
    } else if collections.is_empty() {
        println!("No collections.");
    } else {
        for c in &collections {
            let dimension = c
                .dimension
                .map(|d| d.to_string())
                .unwrap_or_else(|| "-".into());
            println!("{}\t{} items\tdim {dimension}", c.name, c.count);
        }
    }
    Ok(())
}

async fn collection_remove(ctx: &Context, name: &str) -> Result<()> {
    if !ctx.index.delete_collection(name).await? {
        return Err(Error::NotFound {
            kind: "collection",
            name: name.to_string(),
        });
    }
    println!("Removed collection '{name}'");
    Ok(())
}

async fn collection_clear(ctx: &Context, yes: bool) -> Result<()> {
    let count = ctx.index.list_collections().await?.len();
    if count == 0 {
        println!("No collections.");
        return Ok(());
    }

    if !yes {
        print!("Delete all {count} collection(s)? [y/N] ");
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            println!("Aborted.");
            return Ok(());
        }
    }

    let deleted = ctx.index.clear_all().await?;
    println!("Removed {deleted} collection(s)");
    Ok(())
}

async fn cmd_stats(ctx: &Context, json: bool) -> Result<()> {
    let stats = ctx.index.get_stats().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Data directory: {}", ctx.data_dir.root().display());
    println!(
        "Embedding provider: {}",
        ctx.config.embedding.provider
    );
    println!("Distance metric: {:?}", ctx.index.metric());
    println!("Collections: {}", stats.total_collections);
    for c in &stats.collections {
        println!("  {}: {} items", c.name, c.count);
    }
    println!("Items: {}", stats.total_items);
    Ok(())
}
