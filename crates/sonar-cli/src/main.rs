use clap::Parser;
use sonar_cli::{Cli, run};
use sonar_logging::{LogConfig, SonarSubscriberBuilder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = LogConfig::development();
    config.console.ansi = std::io::IsTerminal::is_terminal(&std::io::stderr());
    let _guard = SonarSubscriberBuilder::new()
        .with_config(config)
        .with_level(cli.log_level.clone())
        .init()?;

    let mut stdout = std::io::stdout().lock();
    run(cli.command, &mut stdout).await
}
