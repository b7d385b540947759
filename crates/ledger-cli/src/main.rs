use anyhow::Result;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "ledger-cli")]
#[command(about = "CLI client for the donation ledger node")]
struct Cli {
    /// Node base URL (e.g. http://127.0.0.1:8080)
    #[arg(long, global = true, default_value = "http://127.0.0.1:8080")]
    node: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show chain-wide figures
    Info,
    /// Submit a donation
    Donate {
        /// Project receiving the donation
        #[arg(long)]
        project_id: u64,
        /// Amount, e.g. 100.50
        #[arg(long)]
        amount: Decimal,
        /// Donor display name
        #[arg(long)]
        donor: Option<String>,
        /// Free-text remark
        #[arg(long)]
        remark: Option<String>,
        /// Business-side donation id, unique across the chain
        #[arg(long)]
        donate_id: Option<u64>,
    },
    /// List blocks, newest first
    Blocks {
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long, default_value_t = 10)]
        limit: u64,
    },
    /// Show one block with its transactions
    Block {
        height: u64,
    },
    /// Look up a transaction by its business donation id
    TxStatus {
        donate_id: u64,
    },
    /// Run the chain integrity check
    Validate,
}

#[derive(Serialize)]
struct DonateBody {
    project_id: u64,
    amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    donor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remark: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    external_donate_id: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .pretty()
        .init();

    let cli = Cli::parse();
    let node = cli.node;
    let client = reqwest::Client::new();
    let res = match cli.cmd {
        Command::Info => client.get(format!("{node}/api/v1/chain/info")).send().await?,
        Command::Donate {
            project_id,
            amount,
            donor,
            remark,
            donate_id,
        } => {
            let body = DonateBody {
                project_id,
                amount,
                donor,
                remark,
                external_donate_id: donate_id,
            };
            client
                .post(format!("{node}/api/v1/chain/tx/donate"))
                .json(&body)
                .send()
                .await?
        }
        Command::Blocks { offset, limit } => {
            client
                .get(format!(
                    "{node}/api/v1/chain/blocks?offset={offset}&limit={limit}"
                ))
                .send()
                .await?
        }
        Command::Block { height } => {
            client
                .get(format!("{node}/api/v1/chain/blocks/{height}"))
                .send()
                .await?
        }
        Command::TxStatus { donate_id } => {
            client
                .get(format!("{node}/api/v1/chain/tx/by-donate/{donate_id}"))
                .send()
                .await?
        }
        Command::Validate => {
            client
                .post(format!("{node}/api/v1/chain/validate"))
                .send()
                .await?
        }
    };
    let status = res.status();
    let body = res.text().await?;
    println!("status: {}", status);
    println!("{body}");
    Ok(())
}
