use std::fs::File;
use std::path::Path;

use thiserror::Error;

use crate::params::RunConfig;

#[derive(Error, Debug)]
pub enum LoadConfigError {
    #[error("IO")]
    IO(#[from] std::io::Error),
    #[error("Parse")]
    Parse(#[from] ron::error::SpannedError),
}

pub fn load_config(path: impl AsRef<Path>) -> std::result::Result<RunConfig, LoadConfigError> {
    let f = File::open(path.as_ref())?;
    Ok(ron::de::from_reader(f)?)
}

pub fn save_config(
    config: &RunConfig,
    path: impl AsRef<Path>,
) -> std::result::Result<(), LoadConfigError> {
    let f = File::create(path.as_ref())?;
    ron::ser::to_writer_pretty(f, config, ron::ser::PrettyConfig::new())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    Ok(())
}
