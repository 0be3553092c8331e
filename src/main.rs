use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use webpilot::{Agent, Browser, BrowserConfig, ModelClient, ModelConfig};

#[derive(Parser)]
#[command(name = "webpilot", about = "Drive a browser with a computer-use model")]
struct Cli {
    /// Initial instruction; further instructions are read from stdin
    #[arg(long)]
    input: Option<String>,

    /// Log at debug level
    #[arg(long)]
    debug: bool,

    /// Save each turn's screenshot under a session directory
    #[arg(long)]
    show: bool,

    /// Page the browser opens before the first turn
    #[arg(long, default_value = "https://bing.com")]
    start_url: String,

    /// Run the browser without a visible window
    #[arg(long)]
    headless: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("webpilot=debug,info")
    } else {
        EnvFilter::from_default_env().add_directive("webpilot=info".parse()?)
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut model_cfg = ModelConfig::default();
    if model_cfg.api_key.is_empty() {
        model_cfg.api_key = prompt_api_key()?;
    }
    let model = ModelClient::new(model_cfg)?;

    let browser = match std::env::var("CHROME_WS_URL") {
        Ok(ws) if !ws.trim().is_empty() => Browser::connect(&ws).await?,
        _ => {
            Browser::launch(BrowserConfig {
                headless: cli.headless,
                user_agent: None,
            })
            .await?
        }
    };
    browser.goto(&cli.start_url).await?;

    let mut agent = Agent::new(browser, model);
    if cli.show {
        agent = agent.with_artifacts_dir(std::env::temp_dir().join("webpilot_runs"));
    }

    let result = tokio::select! {
        r = repl(&mut agent, cli.input) => r,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nExiting...");
            Ok(())
        }
    };

    // Release the browser on every exit path, interrupt included.
    agent.shutdown().await?;
    result
}

async fn repl(agent: &mut Agent<Browser, ModelClient>, initial: Option<String>) -> Result<()> {
    let mut pending = initial;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let instruction = match pending.take() {
            Some(input) => input,
            None => {
                eprint!("\nEnter your instruction (or 'exit' to quit): ");
                match lines.next_line().await? {
                    Some(line) => line,
                    None => break,
                }
            }
        };
        let instruction = instruction.trim();
        if instruction.is_empty() {
            continue;
        }
        if matches!(instruction.to_lowercase().as_str(), "exit" | "quit") {
            break;
        }

        match agent.run_turn(Some(instruction)).await {
            Ok(reply) => println!("\nAgent response:\n{reply}"),
            Err(e) => eprintln!("Turn failed: {e}"),
        }
    }
    Ok(())
}

fn prompt_api_key() -> Result<String> {
    eprintln!("Warning: OPENAI_API_KEY environment variable is not set.");
    eprint!("Please enter your OpenAI API key: ");
    let mut key = String::new();
    std::io::stdin().read_line(&mut key)?;
    let key = key.trim().to_string();
    if key.is_empty() {
        anyhow::bail!("no API key provided");
    }
    Ok(key)
}
