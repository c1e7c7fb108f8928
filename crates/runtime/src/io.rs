use crate::{Error, Result};
use std::io::Write;

/// The writer interface used by the runtime's output functions
///
/// Print and PrintLn write through the handles installed in
/// [MilkVmSettings](crate::MilkVmSettings), so embedders and tests can capture or
/// redirect script output.
pub trait MilkWrite {
    /// Writes the given string
    fn write(&self, output: &str) -> Result<()>;

    /// Writes the given string, followed by a newline
    fn write_line(&self, output: &str) -> Result<()> {
        self.write(output)?;
        self.write("\n")
    }
}

fn map_io_error(error: std::io::Error) -> Error {
    Error::from(error.to_string())
}

/// The default writer for the runtime's stdout
#[derive(Default)]
pub struct DefaultStdout;

impl MilkWrite for DefaultStdout {
    fn write(&self, output: &str) -> Result<()> {
        std::io::stdout()
            .write_all(output.as_bytes())
            .map_err(map_io_error)
    }
}

/// The default writer for the runtime's stderr
#[derive(Default)]
pub struct DefaultStderr;

impl MilkWrite for DefaultStderr {
    fn write(&self, output: &str) -> Result<()> {
        std::io::stderr()
            .write_all(output.as_bytes())
            .map_err(map_io_error)
    }
}
