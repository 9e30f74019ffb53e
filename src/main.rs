use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use quick_xml::escape::escape;
use tracing::debug;

use soap_stream::{
    Cli, ConfigManager, Credential, NodeTree, ResponseDelegate, ResponseMetadata, SoapAction,
    SoapClient, SoapError,
};

/// Prints units, stream chunks and the final tree to stdout
#[derive(Default)]
struct PrintingDelegate {
    failure: Mutex<Option<String>>,
}

impl PrintingDelegate {
    fn record_failure(&self, kind: &str, error: &SoapError) {
        eprintln!("{}: {}", kind, error);
        if let Ok(mut failure) = self.failure.lock() {
            *failure = Some(error.to_string());
        }
    }

    fn failure(&self) -> Option<String> {
        self.failure.lock().ok().and_then(|failure| failure.clone())
    }
}

fn render(unit: &NodeTree) -> String {
    match unit.root().to_dictionary() {
        Ok(dictionary) => serde_json::to_string_pretty(&dictionary)
            .unwrap_or_else(|_| unit.root().to_xml_string()),
        Err(_) => unit.root().to_xml_string(),
    }
}

impl ResponseDelegate for PrintingDelegate {
    fn progress(&self, fraction: f64) {
        debug!(progress = format_args!("{:.0}%", fraction * 100.0), "progress");
    }

    fn response_started(&self, metadata: &ResponseMetadata) {
        eprintln!("HTTP {} from {}", metadata.status, metadata.url);
    }

    fn unit_received(&self, unit: NodeTree) {
        println!("{}", render(&unit));
    }

    fn content_received(&self, text: &str, tag: &str, last_chunk: bool) {
        let mut stdout = std::io::stdout().lock();
        let _ = write!(stdout, "{}", text);
        if last_chunk {
            let _ = writeln!(stdout, "\n-- end of <{}>", tag);
        }
        let _ = stdout.flush();
    }

    fn ordered_tag_received(&self, tag: &str, unit: NodeTree) {
        println!("[{}] {}", tag, render(&unit));
    }

    fn entire_response_received(&self, tree: NodeTree) {
        let document = tree.root().children().next();
        eprintln!(
            "Response complete: <{}> with {} nodes",
            document.map(|node| node.name()).unwrap_or("?"),
            tree.node_count() - 1
        );
    }

    fn failed_loading(&self, error: &SoapError) {
        self.record_failure("Loading failed", error);
    }

    fn failed_authentication(&self, error: &SoapError) {
        self.record_failure("Authentication failed", error);
    }

    fn failed_connection(&self, error: &SoapError) {
        self.record_failure("Connection failed", error);
    }

    fn failed_common(&self, error: &SoapError) {
        self.record_failure("Failed", error);
    }
}

fn build_action(cli: &Cli) -> Result<SoapAction> {
    let mut action = SoapAction::parse(&cli.url, cli.action.as_str())?;
    if let Some(namespace) = &cli.namespace {
        action.action_tag_attributes = format!(r#"xmlns="{}""#, escape(namespace.as_str()));
    }
    action.parameters = cli.get_parameters().map_err(|e| anyhow!(e))?;
    if let (Some(username), Some(password)) = (&cli.username, &cli.password) {
        action.credential = Some(Credential::new(username.as_str(), password.as_str()));
    }
    Ok(action)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.verbosity().filter_directive().into()),
        )
        .init();

    cli.validate().map_err(|e| anyhow!(e))?;

    let config = ConfigManager::load_config(&cli)
        .await
        .context("failed to load configuration")?;

    let mut action = build_action(&cli)?;
    config.apply_to(&mut action);

    let transport = config
        .network
        .transport()
        .context("failed to create HTTP transport")?;
    let client = SoapClient::new(Arc::new(transport));
    let delegate = Arc::new(PrintingDelegate::default());

    let engine = client.load(&action, delegate.clone())?;
    let run = engine.wait();
    tokio::pin!(run);
    tokio::select! {
        _ = &mut run => {}
        _ = tokio::signal::ctrl_c() => {
            engine.cancel();
            run.await;
            return Err(anyhow!("interrupted"));
        }
    }

    match delegate.failure() {
        Some(failure) => Err(anyhow!(failure)),
        None => Ok(()),
    }
}
