//! Answer one question against a data directory without starting the server.
//!
//! Usage: `ask <data_dir> <question...>`

use anyhow::{bail, Result};
use dataquery::{
    resolve::{resolve, Question},
    store::RowStore,
};
use std::env;
use tracing_subscriber::{fmt, EnvFilter};

fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let Some(data_dir) = args.next() else {
        bail!("usage: ask <data_dir> <question...>");
    };
    let question = args.collect::<Vec<_>>().join(" ");

    let store = RowStore::open(&data_dir)?;
    let question = Question::parse(&question)?;
    let result = resolve(&question, &store.list_all());
    println!("{}", result.message);
    Ok(())
}
