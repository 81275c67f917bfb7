//! Database setup and server commands.

use anyhow::Result;

use factory_line::config::FactoryConfig;
use factory_line::factory::server::{ServerConfig, start_server};

use super::open_db;

pub fn cmd_init(config: &FactoryConfig, seed: bool) -> Result<()> {
    let db = open_db(config)?;
    println!(
        "Factory database initialized at {}",
        console::style(config.database.path.display()).bold()
    );
    if seed || config.simulation.seed_catalog {
        let inserted = db.seed_default_catalog()?;
        println!("Seeded {} process steps", inserted);
    }
    Ok(())
}

pub async fn cmd_serve(config: &FactoryConfig, port: Option<u16>, dev: bool) -> Result<()> {
    let mut server = ServerConfig::from(config);
    if let Some(port) = port {
        server.port = port;
    }
    server.dev_mode |= dev;
    start_server(server).await
}
