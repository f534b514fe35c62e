use std::path::Path;

use bucketfs::config::load_config;
use bucketfs::logging;
use bucketfs::vfs::demo::e2e_memory_demo;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("demo") => {
            let path = args.next();
            let config = load_config(path.as_deref().map(Path::new))?;
            logging::init(&config.logging)?;
            e2e_memory_demo(config).await?;
            println!("demo: OK");
        }
        _ => {
            println!("Hello, I'm bucketfs!\nUsage:\n  bucketfs demo [config.yaml]");
        }
    }
    Ok(())
}
