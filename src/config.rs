//! Engine configuration: the interface surface the CLI (§4.7) builds and the
//! engine (§4.4) consumes.

/// How bytes written by a client to the server's standard-output endpoint are
/// routed (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Copy verbatim to the process's standard output. Default.
    #[default]
    Stream,
    /// Copy to standard output, and also feed back into the Record Parser as
    /// if it had arrived on standard input.
    Copy,
    /// Discard.
    Sink,
}

/// Default JSON-server port; the NMEA 0183 port is always this value plus 1.
pub const DEFAULT_PORT: u16 = 2597;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub json_port: u16,
    pub output_mode: OutputMode,
}

impl EngineConfig {
    pub fn nmea0183_port(&self) -> u16 {
        self.json_port + 1
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            json_port: DEFAULT_PORT,
            output_mode: OutputMode::default(),
        }
    }
}
