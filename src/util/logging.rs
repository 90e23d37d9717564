// Copyright (C) 2025 HasX
// Licensed under the GNU AGPL v3.0. See LICENSE file for details.
// Website: https://hasx.dev

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogVerbosity {
    Normal,
    Verbose,
    Debug,
}

impl LogVerbosity {
    /// Maps the number of `-v` flags given on the command line.
    pub fn from_count(count: u8) -> Self {
        match count {
            0 => LogVerbosity::Normal,
            1 => LogVerbosity::Verbose,
            _ => LogVerbosity::Debug,
        }
    }

    fn level(self) -> log::LevelFilter {
        match self {
            LogVerbosity::Normal => log::LevelFilter::Info,
            LogVerbosity::Verbose => log::LevelFilter::Debug,
            LogVerbosity::Debug => log::LevelFilter::Trace,
        }
    }
}

pub fn init_logger(verbosity: LogVerbosity) {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(verbosity.level())
        // HTTP client internals are only interesting when chasing transport bugs.
        .filter_module("reqwest", log::LevelFilter::Warn)
        .filter_module("hyper", log::LevelFilter::Warn)
        .filter_module("rustls", log::LevelFilter::Warn)
        .format_timestamp_millis()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_from_flag_count() {
        assert_eq!(LogVerbosity::from_count(0), LogVerbosity::Normal);
        assert_eq!(LogVerbosity::from_count(1), LogVerbosity::Verbose);
        assert_eq!(LogVerbosity::from_count(7), LogVerbosity::Debug);
        assert_eq!(LogVerbosity::Verbose.level(), log::LevelFilter::Debug);
    }
}
