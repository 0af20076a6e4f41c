use chrono::Utc;
use clap::{Parser, Subcommand};
use docrank_core::{
    answer, max_point_id, next_doc_id_start, render_references, CharacterNgramEmbedder, ChatClient, Embedder,
    EmbeddingProvider, Ingestor, OpenAiEmbedder, QdrantStore, RankingStatus, RetrievalOutcome,
    RetrievalPipeline, SearchQuery, Settings,
};
use futures::StreamExt;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "docrank", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML settings file
    #[arg(long, env = "DOCRANK_CONFIG")]
    config: Option<PathBuf>,

    /// Qdrant base URL
    #[arg(long, env = "QDRANT_URL")]
    qdrant_url: Option<String>,

    /// Qdrant API key
    #[arg(long, env = "QDRANT_API_KEY", hide_env_values = true)]
    qdrant_api_key: Option<String>,

    /// Qdrant collection
    #[arg(long)]
    collection: Option<String>,

    /// Key for the embedding and chat endpoints
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a folder of .docx, .pdf, mailbox and forum .jsonl files.
    Ingest {
        /// Folder scanned recursively.
        #[arg(long)]
        folder: PathBuf,
        /// Drop and recreate the collection first.
        #[arg(long, default_value_t = false)]
        recreate: bool,
        /// Store chunks without LLM summaries.
        #[arg(long, default_value_t = false)]
        no_summaries: bool,
    },
    /// Vector search followed by relevance judgment; prints ranked chunks and references.
    Search {
        #[arg(long)]
        query: String,
        /// Number of vector candidates.
        #[arg(long)]
        top_k: Option<usize>,
        /// Category tag to leave out (repeatable), e.g. `forum` or `mail`.
        #[arg(long = "exclude")]
        exclude: Vec<String>,
        /// Search the question as typed, without LLM rewriting.
        #[arg(long, default_value_t = false)]
        no_refine: bool,
    },
    /// Search, then stream an answer grounded in the ranked chunks.
    Ask {
        #[arg(long)]
        query: String,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long = "exclude")]
        exclude: Vec<String>,
        #[arg(long, default_value_t = false)]
        no_refine: bool,
    },
    /// Print the largest stored point id and the next document id.
    MaxId,
}

fn load_settings(cli: &Cli) -> anyhow::Result<Settings> {
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(url) = &cli.qdrant_url {
        settings.store.url = url.clone();
    }
    if let Some(api_key) = &cli.qdrant_api_key {
        settings.store.api_key = Some(api_key.clone());
    }
    if let Some(collection) = &cli.collection {
        settings.store.collection = collection.clone();
    }
    Ok(settings)
}

fn build_embedder(settings: &Settings, api_key: Option<String>) -> anyhow::Result<Box<dyn Embedder>> {
    Ok(match settings.embedding.provider {
        EmbeddingProvider::Openai => Box::new(
            OpenAiEmbedder::new(
                &settings.embedding.url,
                api_key,
                &settings.embedding.model,
                settings.embedding.dimensions(),
                settings.embedding.timeout(),
            )?
            .with_max_retries(settings.embedding.max_retries),
        ),
        EmbeddingProvider::Ngram => Box::new(CharacterNgramEmbedder {
            dimensions: settings.embedding.dimensions(),
        }),
    })
}

fn build_chat(settings: &Settings, api_key: Option<String>) -> anyhow::Result<ChatClient> {
    Ok(ChatClient::new(
        &settings.llm.url,
        api_key,
        &settings.llm.model,
        &settings.llm.judge_model,
        settings.llm.timeout(),
    )?)
}

fn build_pipeline(
    settings: &Settings,
    store: QdrantStore,
    api_key: Option<String>,
    refine: bool,
) -> anyhow::Result<RetrievalPipeline<QdrantStore, Box<dyn Embedder>, ChatClient>> {
    let embedder = build_embedder(settings, api_key.clone())?;
    let pipeline = RetrievalPipeline::new(store, embedder, build_chat(settings, api_key.clone())?);
    Ok(if refine {
        pipeline.with_refiner(Box::new(build_chat(settings, api_key)?))
    } else {
        pipeline
    })
}

fn search_query(settings: &Settings, query: String, top_k: Option<usize>, exclude: Vec<String>) -> SearchQuery {
    let exclude = if exclude.is_empty() {
        settings.retrieval.excluded_categories.clone()
    } else {
        exclude
    };
    SearchQuery::new(query, top_k.unwrap_or(settings.retrieval.top_k)).excluding(exclude)
}

fn print_status(outcome: &RetrievalOutcome) {
    match outcome.status {
        RankingStatus::Ranked => {}
        RankingStatus::NoCandidates => println!("no documents matched the query"),
        RankingStatus::NoRelevantDocuments => println!(
            "{} candidates found, none judged relevant",
            outcome.candidates.len()
        ),
        RankingStatus::JudgmentUnavailable => {
            println!("relevance judgment unavailable; showing vector order")
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    let api_key = cli.openai_api_key.clone();

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        collection = %settings.store.collection,
        "docrank boot"
    );

    let store = QdrantStore::connect(
        &settings.store.url,
        &settings.store.collection,
        settings.vector_size(),
        settings.store.api_key.clone(),
    )
    .await?;

    match cli.command {
        Command::Ingest {
            folder,
            recreate,
            no_summaries,
        } => {
            let embedder = build_embedder(&settings, api_key.clone())?;
            let chat = build_chat(&settings, api_key)?;
            let mut options = settings.ingestion_options();
            options.summarize = options.summarize && !no_summaries;

            let mut ingestor = Ingestor::new(&store, embedder.as_ref(), options.clone())
                .with_retry_policy(settings.retry_policy());
            if options.summarize {
                ingestor = ingestor.with_summarizer(&chat);
            }

            let report = ingestor.run(&folder, recreate).await?;

            for skipped in &report.skipped_files {
                println!("skipped {}: {}", skipped.path.display(), skipped.reason);
            }
            for failed in &report.failed_points {
                println!("not stored: id={} source={} ({})", failed.id, failed.source, failed.cause);
            }
            println!(
                "{} documents, {} chunks ingested from doc id {} (run {}) at {}",
                report.documents,
                report.chunks_written,
                report.next_doc_id_start,
                report.run_id,
                Utc::now().to_rfc3339()
            );
        }
        Command::Search {
            query,
            top_k,
            exclude,
            no_refine,
        } => {
            let pipeline = build_pipeline(&settings, store, api_key, !no_refine)?;
            let outcome = pipeline
                .retrieve_and_rank(&search_query(&settings, query, top_k, exclude))
                .await?;

            println!("query: {}", outcome.query);
            print_status(&outcome);
            for (rank, hit) in outcome.ranked.iter().enumerate() {
                println!(
                    "[{}] id={} score={:.4} title={}",
                    rank + 1,
                    hit.id,
                    hit.score,
                    hit.payload.doc_title
                );
                println!("  {}", hit.payload.raw_text);
            }
            for line in render_references(&outcome.references(&settings.citations.source_overrides)) {
                println!("{line}");
            }
        }
        Command::Ask {
            query,
            top_k,
            exclude,
            no_refine,
        } => {
            let pipeline = build_pipeline(&settings, store, api_key, !no_refine)?;
            let outcome = pipeline
                .retrieve_and_rank(&search_query(&settings, query, top_k, exclude))
                .await?;
            print_status(&outcome);

            let mut reply = answer(
                pipeline.judge(),
                &[],
                &outcome,
                &settings.citations.source_overrides,
            )
            .await?;

            let mut stdout = tokio::io::stdout();
            while let Some(fragment) = reply.text.next().await {
                stdout.write_all(fragment?.as_bytes()).await?;
                stdout.flush().await?;
            }
            stdout.write_all(b"\n").await?;

            if !reply.references.is_empty() {
                stdout.write_all(b"---\nReferences\n").await?;
                for line in render_references(&reply.references) {
                    stdout.write_all(format!("{line}\n").as_bytes()).await?;
                }
            }
            stdout.flush().await?;
        }
        Command::MaxId => {
            let max_id = max_point_id(&store, docrank_core::store::SCROLL_PAGE_SIZE).await?;
            if max_id == 0 {
                warn!(collection = %settings.store.collection, "collection is empty");
            }
            println!("max id {max_id}; next doc id {}", next_doc_id_start(max_id));
        }
    }

    Ok(())
}
