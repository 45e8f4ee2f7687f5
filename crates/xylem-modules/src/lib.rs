//! Stock modules for Xylem trees.
//!
//! Enable module groups via feature flags.
//!
//! # Features
//!
//! - `sources` (default) - `source.text`, `source.file`
//! - `sinks` (default) - `sink.file`, `sink.stdout`
//! - `analysis` (default) - `analysis.minkowski-distance-matrix`
//! - `all` - All modules
//!
//! `passthrough` is always available.

use xylem::{
    ConfigError, InputPort, Module, ModuleCore, ModuleError, ModuleRegistry, OutputPort, PipeKind,
    Properties,
};

#[cfg(feature = "analysis")]
mod minkowski;
#[cfg(feature = "analysis")]
pub use minkowski::{MinkowskiDistanceMatrix, distance_matrix, minkowski_distance};

const ID_INPUT: &str = "input";
const ID_OUTPUT: &str = "output";

/// Register all enabled modules with the registry.
pub fn register_all(registry: &mut ModuleRegistry) {
    register(registry, "passthrough", Passthrough::new);

    #[cfg(feature = "sources")]
    {
        register(registry, "source.text", TextSource::new);
        register(registry, "source.file", FileSource::new);
    }
    #[cfg(feature = "sinks")]
    {
        register(registry, "sink.file", FileSink::new);
        register(registry, "sink.stdout", StdoutSink::new);
    }
    #[cfg(feature = "analysis")]
    register(registry, "analysis.minkowski-distance-matrix", MinkowskiDistanceMatrix::new);
}

fn register<M, F>(registry: &mut ModuleRegistry, id: &str, make: F)
where
    M: Module + 'static,
    F: Fn(Properties) -> M + Send + Sync + 'static,
{
    registry.register(id, move |config| -> Box<dyn Module> { Box::new(make(config)) });
}

/// List of enabled module ids.
pub fn enabled_modules() -> Vec<&'static str> {
    #[allow(unused_mut)]
    let mut modules = vec!["passthrough"];

    #[cfg(feature = "sources")]
    modules.extend(["source.text", "source.file"]);
    #[cfg(feature = "sinks")]
    modules.extend(["sink.file", "sink.stdout"]);
    #[cfg(feature = "analysis")]
    modules.push("analysis.minkowski-distance-matrix");

    modules
}

/// Input port accepting either pipe kind.
fn any_input(description: &str) -> InputPort {
    InputPort::new(ID_INPUT, description)
        .accept(PipeKind::Char)
        .accept(PipeKind::Byte)
}

/// Output port feeding either pipe kind.
fn any_output(description: &str) -> OutputPort {
    OutputPort::new(ID_OUTPUT, description)
        .accept(PipeKind::Char)
        .accept(PipeKind::Byte)
}

/// Length of the longest valid UTF-8 prefix, allowing an incomplete
/// sequence at the end. `offset` is the stream position of `bytes[0]`.
fn utf8_prefix(bytes: &[u8], offset: usize) -> Result<usize, ModuleError> {
    match std::str::from_utf8(bytes) {
        Ok(_) => Ok(bytes.len()),
        Err(e) if e.error_len().is_none() => Ok(e.valid_up_to()),
        Err(e) => Err(ModuleError::InvalidInput(format!(
            "invalid UTF-8 at byte {}",
            offset + e.valid_up_to()
        ))),
    }
}

// ============================================
// Passthrough
// ============================================

/// Copies its input to every consumer of its output, chunk by chunk.
pub struct Passthrough {
    core: ModuleCore,
}

impl Passthrough {
    pub fn new(config: Properties) -> Self {
        let core = ModuleCore::new("Passthrough")
            .with_category("Tools")
            .with_description("Forwards its input unchanged.")
            .input(any_input("Data to forward."))
            .output(any_output("The same data."))
            .configure(config);
        Self { core }
    }
}

impl Module for Passthrough {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModuleCore {
        &mut self.core
    }

    fn process(&mut self) -> Result<bool, ModuleError> {
        let (reader, output) = self.core.split_io(ID_INPUT, ID_OUTPUT)?;
        if reader.kind() == PipeKind::Char || !output.feeds(PipeKind::Char) {
            while let Some(chunk) = reader.read() {
                output.write(&chunk)?;
            }
            return Ok(true);
        }

        // Byte chunks may end inside a character the char pipes can't take.
        let mut carry = Vec::new();
        let mut position = 0;
        while let Some(chunk) = reader.read() {
            carry.extend_from_slice(chunk.as_bytes());
            let valid = utf8_prefix(&carry, position)?;
            if valid > 0 {
                output.write_bytes(&carry[..valid])?;
                carry.drain(..valid);
                position += valid;
            }
        }
        if !carry.is_empty() {
            return Err(ModuleError::InvalidInput(format!(
                "input ends inside a UTF-8 sequence at byte {position}"
            )));
        }
        Ok(true)
    }
}

// ============================================
// Sources
// ============================================

#[cfg(feature = "sources")]
mod sources_impl {
    use super::*;
    use std::fs::File;
    use std::io::{ErrorKind, Read};
    use std::path::PathBuf;

    pub const PROPERTY_TEXT: &str = "text";
    pub const PROPERTY_PATH: &str = "path";
    pub const PROPERTY_MODE: &str = "mode";
    pub const PROPERTY_CHUNK_SIZE: &str = "chunk size";

    /// Emits a configured piece of text.
    pub struct TextSource {
        core: ModuleCore,
        text: String,
    }

    impl TextSource {
        pub fn new(config: Properties) -> Self {
            let core = ModuleCore::new("Text Source")
                .with_category("I/O")
                .with_description("Outputs the text given in its properties.")
                .property(PROPERTY_TEXT, "", "Text to output.")
                .output(any_output("The configured text."))
                .configure(config);
            Self {
                core,
                text: String::new(),
            }
        }
    }

    impl Module for TextSource {
        fn core(&self) -> &ModuleCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut ModuleCore {
            &mut self.core
        }

        fn apply_properties(&mut self) -> Result<(), ConfigError> {
            self.core.apply()?;
            self.text = self
                .core
                .properties()
                .get(PROPERTY_TEXT)
                .unwrap_or_default()
                .to_string();
            Ok(())
        }

        fn process(&mut self) -> Result<bool, ModuleError> {
            self.core.output_port_mut(ID_OUTPUT)?.write_text(&self.text)?;
            Ok(true)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum ReadMode {
        Text,
        Bytes,
    }

    /// Streams a file in fixed-size chunks.
    ///
    /// In text mode chunks are cut on character boundaries and invalid
    /// UTF-8 fails the module.
    pub struct FileSource {
        core: ModuleCore,
        path: PathBuf,
        mode: ReadMode,
        chunk_size: usize,
    }

    impl FileSource {
        pub fn new(config: Properties) -> Self {
            // Bytes mode prefers byte pipes when children are wired automatically.
            let bytes = config
                .get(PROPERTY_MODE)
                .is_some_and(|m| m.trim().eq_ignore_ascii_case("bytes"));
            let output = if bytes {
                OutputPort::new(ID_OUTPUT, "File contents.")
                    .accept(PipeKind::Byte)
                    .accept(PipeKind::Char)
            } else {
                any_output("File contents.")
            };
            let core = ModuleCore::new("File Source")
                .with_category("I/O")
                .with_description("Reads a file and outputs its contents.")
                .required_property(PROPERTY_PATH, "Path of the file to read.")
                .property(PROPERTY_MODE, "text", "How to read the file [text|bytes].")
                .property(PROPERTY_CHUNK_SIZE, "8192", "Bytes read per chunk.")
                .output(output)
                .configure(config);
            Self {
                core,
                path: PathBuf::new(),
                mode: ReadMode::Text,
                chunk_size: 8192,
            }
        }
    }

    impl Module for FileSource {
        fn core(&self) -> &ModuleCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut ModuleCore {
            &mut self.core
        }

        fn apply_properties(&mut self) -> Result<(), ConfigError> {
            self.core.apply()?;
            let props = self.core.properties();
            self.path = PathBuf::from(props.require(PROPERTY_PATH)?);
            self.mode = match props.get_choice(PROPERTY_MODE, &["text", "bytes"])? {
                "bytes" => ReadMode::Bytes,
                _ => ReadMode::Text,
            };
            self.chunk_size = props.get_parsed(PROPERTY_CHUNK_SIZE)?;
            if self.chunk_size == 0 {
                return Err(ConfigError::invalid(
                    PROPERTY_CHUNK_SIZE,
                    "0",
                    "must be at least 1",
                ));
            }
            Ok(())
        }

        fn process(&mut self) -> Result<bool, ModuleError> {
            let mut file = File::open(&self.path)?;
            let output = self.core.output_port_mut(ID_OUTPUT)?;
            let mut buf = vec![0u8; self.chunk_size];
            let mut carry: Vec<u8> = Vec::new();
            let mut total = 0usize;

            loop {
                let n = match file.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                };
                total += n;
                match self.mode {
                    ReadMode::Bytes => output.write_bytes(&buf[..n])?,
                    ReadMode::Text => {
                        carry.extend_from_slice(&buf[..n]);
                        let valid = utf8_prefix(&carry, total - carry.len())?;
                        if valid > 0 {
                            let text = String::from_utf8(carry.drain(..valid).collect())
                                .map_err(|e| ModuleError::InvalidInput(e.to_string()))?;
                            output.write_text(&text)?;
                        }
                    }
                }
            }
            if !carry.is_empty() {
                return Err(ModuleError::InvalidInput(format!(
                    "{} ends inside a UTF-8 sequence",
                    self.path.display()
                )));
            }
            tracing::debug!(path = %self.path.display(), bytes = total, "file read");
            Ok(true)
        }
    }
}

#[cfg(feature = "sources")]
pub use sources_impl::{FileSource, TextSource};

// ============================================
// Sinks
// ============================================

#[cfg(feature = "sinks")]
mod sinks_impl {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::{self, BufWriter, Write};
    use std::path::PathBuf;

    pub const PROPERTY_PATH: &str = "path";
    pub const PROPERTY_APPEND: &str = "append";

    /// Writes everything it receives to a file.
    pub struct FileSink {
        core: ModuleCore,
        path: PathBuf,
        append: bool,
    }

    impl FileSink {
        pub fn new(config: Properties) -> Self {
            let core = ModuleCore::new("File Sink")
                .with_category("I/O")
                .with_description("Writes its input to a file.")
                .required_property(PROPERTY_PATH, "Path of the file to write.")
                .property(PROPERTY_APPEND, "false", "Append instead of truncating [true|false].")
                .input(any_input("Data to write."))
                .configure(config);
            Self {
                core,
                path: PathBuf::new(),
                append: false,
            }
        }
    }

    impl Module for FileSink {
        fn core(&self) -> &ModuleCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut ModuleCore {
            &mut self.core
        }

        fn apply_properties(&mut self) -> Result<(), ConfigError> {
            self.core.apply()?;
            let props = self.core.properties();
            self.path = PathBuf::from(props.require(PROPERTY_PATH)?);
            self.append = props.get_bool(PROPERTY_APPEND)?;
            Ok(())
        }

        fn process(&mut self) -> Result<bool, ModuleError> {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .append(self.append)
                .truncate(!self.append)
                .open(&self.path)?;
            let mut writer = BufWriter::new(file);
            let reader = self.core.reader(ID_INPUT)?;
            while let Some(chunk) = reader.read() {
                writer.write_all(chunk.as_bytes())?;
            }
            writer.flush()?;
            Ok(true)
        }
    }

    /// Writes everything it receives to standard output.
    pub struct StdoutSink {
        core: ModuleCore,
    }

    impl StdoutSink {
        pub fn new(config: Properties) -> Self {
            let core = ModuleCore::new("Standard Output")
                .with_category("I/O")
                .with_description("Writes its input to standard output.")
                .input(any_input("Data to print."))
                .configure(config);
            Self { core }
        }
    }

    impl Module for StdoutSink {
        fn core(&self) -> &ModuleCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut ModuleCore {
            &mut self.core
        }

        fn process(&mut self) -> Result<bool, ModuleError> {
            let reader = self.core.reader(ID_INPUT)?;
            let mut stdout = io::stdout().lock();
            while let Some(chunk) = reader.read() {
                stdout.write_all(chunk.as_bytes())?;
            }
            stdout.flush()?;
            Ok(true)
        }
    }
}

#[cfg(feature = "sinks")]
pub use sinks_impl::{FileSink, StdoutSink};
