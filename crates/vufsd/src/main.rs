use {
    clap::Parser,
    log::LevelFilter,
    std::path::PathBuf,
    vufs::{srv::VuFs, utils::listen_addr, DEFAULT_PORT},
};

#[derive(Debug, clap::Parser)]
struct Cli {
    /// Directory to export
    root: PathBuf,

    /// Listen endpoint; a bare :port binds every interface
    #[arg(long, default_value = DEFAULT_PORT)]
    addr: String,

    /// Trace requests and responses to standard error
    #[arg(short, long)]
    verbose: bool,
}

async fn vufsd_main(Cli { root, addr, verbose: _ }: Cli) -> vufs::Result<i32> {
    let fs = VuFs::new(root).await?;
    let server = fs.serve(&listen_addr(&addr)).await?;

    println!("[*] Ready to accept clients: {}", server.local_addr());

    tokio::signal::ctrl_c().await.map_err(vufs::Error::from)?;
    server.stop().await?;

    Ok(0)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if cli.verbose {
        builder.filter_level(LevelFilter::Debug);
    }
    builder.init();

    let exit_code = vufsd_main(cli).await.unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        -1
    });

    std::process::exit(exit_code);
}
