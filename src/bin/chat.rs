use std::io::{self, BufRead, Write};

use anyhow::Result;
use clap::Parser;
use supportbot::llm::DEFAULT_TEMPERATURE;
use supportbot::workflow::DEFAULT_TOP_K;
use supportbot::{
    init_tracing, ChatMessage, ChatModel, Embedder, LocalVectorStore, ProviderArgs, VectorStore,
    Workflow,
};
use uuid::Uuid;

const EXIT_WORDS: [&str; 3] = ["quit", "exit", "q"];

#[derive(Parser, Debug)]
#[command(
    name = "supportbot-chat",
    about = "Chat with the support assistant over the ingested documents"
)]
struct ChatCli {
    #[command(flatten)]
    provider: ProviderArgs,

    /// Chat model used for answers
    #[arg(long, env = "SUPPORTBOT_CHAT_MODEL", default_value = "llama3.2")]
    chat_model: String,

    /// Sampling temperature for the answer model
    #[arg(long, env = "SUPPORTBOT_TEMPERATURE", default_value_t = DEFAULT_TEMPERATURE)]
    temperature: f32,

    /// Number of documents placed in the prompt
    #[arg(long, env = "SUPPORTBOT_TOP_K", default_value_t = DEFAULT_TOP_K)]
    top_k: usize,

    /// Ask a single question, print the answer and exit
    #[arg(long)]
    query: Option<String>,

    /// Check that the collection and providers are reachable, then exit
    #[arg(long, default_value_t = false)]
    check: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = ChatCli::parse();
    let embedder = cli.provider.build_embedder()?;
    let model = cli
        .provider
        .build_chat_model(&cli.chat_model, cli.temperature)?;
    let collection_dir = cli.provider.collection_dir()?;
    let store = if LocalVectorStore::exists(&collection_dir) {
        Some(LocalVectorStore::open(&collection_dir)?)
    } else {
        tracing::warn!(
            "no collection at {}; run supportbot-ingest first",
            collection_dir.display()
        );
        None
    };

    if cli.check {
        let healthy = run_checks(store.as_ref(), embedder.as_ref(), model.as_ref());
        anyhow::ensure!(healthy, "setup check failed");
        return Ok(());
    }

    let workflow = Workflow::new(embedder, store, model).with_top_k(cli.top_k);
    if let Some(query) = cli.query {
        let state = workflow.invoke(&query, None);
        println!("{}", state.last_reply().unwrap_or("No response generated."));
        return Ok(());
    }

    let stdin = io::stdin();
    let stdout = io::stdout();
    run_session(&workflow, stdin.lock(), stdout.lock())
}

fn run_session<E, V, M, R, W>(workflow: &Workflow<E, V, M>, input: R, mut out: W) -> Result<()>
where
    E: Embedder,
    V: VectorStore,
    M: ChatModel,
    R: BufRead,
    W: Write,
{
    let rule = "-".repeat(50);
    writeln!(out, "\n{}", "=".repeat(50))?;
    writeln!(out, "Support chatbot CLI")?;
    writeln!(out, "{}", "=".repeat(50))?;
    writeln!(out, "Type 'quit', 'exit', or 'q' to end the session.")?;
    writeln!(out, "{rule}")?;
    let thread_id = Uuid::new_v4().to_string();
    writeln!(out, "Session ID: {thread_id}\n")?;

    let mut lines = input.lines();
    loop {
        write!(out, "You: ")?;
        out.flush()?;
        let Some(line) = lines.next() else {
            writeln!(out, "\nGoodbye!")?;
            break;
        };
        let line = line?;
        let message = line.trim();
        if EXIT_WORDS.contains(&message.to_lowercase().as_str()) {
            writeln!(out, "\nGoodbye!")?;
            break;
        }
        if message.is_empty() {
            continue;
        }
        let state = workflow.invoke(message, Some(&thread_id));
        writeln!(
            out,
            "Bot: {}",
            state.last_reply().unwrap_or("No response generated.")
        )?;
        writeln!(out, "{rule}")?;
    }
    Ok(())
}

fn run_checks(
    store: Option<&LocalVectorStore>,
    embedder: &dyn Embedder,
    model: &dyn ChatModel,
) -> bool {
    let mut healthy = true;
    match store {
        Some(store) => println!("ok      collection loaded ({} records)", store.len()),
        None => {
            println!("FAILED  collection missing; run supportbot-ingest");
            healthy = false;
        }
    }
    match embedder.embed_one("ping") {
        Ok(vector) => println!("ok      embedding provider ({} dimensions)", vector.len()),
        Err(err) => {
            println!("FAILED  embedding provider: {}", truncate(&format!("{err:#}"), 100));
            healthy = false;
        }
    }
    match model.complete(&[ChatMessage::user("Say 'OK'")]) {
        Ok(reply) => println!("ok      chat model replied: {}", truncate(reply.trim(), 100)),
        Err(err) => {
            println!("FAILED  chat model: {}", truncate(&format!("{err:#}"), 100));
            healthy = false;
        }
    }
    healthy
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
