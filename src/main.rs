use clap::Parser;
use gitbackup::{
    crds::{Collection, Repository},
    settings::Settings,
};
use kube::CustomResourceExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
enum Args {
    /// Run the Repository and Collection controllers.
    Run(Settings),
    /// Print the CustomResourceDefinitions as YAML.
    Crds,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args {
        Args::Crds => {
            let docs = [
                serde_yaml::to_string(&Repository::crd())?,
                serde_yaml::to_string(&Collection::crd())?,
            ];
            print!("{}", docs.join("---\n"));
        }
        Args::Run(settings) => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .init();
            gitbackup::run(settings).await?;
        }
    };

    Ok(())
}
