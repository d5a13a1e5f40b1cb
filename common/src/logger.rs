use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub level: LevelFilter,
    pub disable_colors: bool,
    pub disable_file_logging: bool,
    pub filename_log: String,
    pub logs_path: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
            disable_colors: false,
            disable_file_logging: false,
            filename_log: String::from("kale-pool.log"),
            logs_path: String::from("logs/"),
        }
    }
}

// Colored stdout plus an optional date-based log file. Noisy
// third-party crates are pinned to warn regardless of the chosen level.
pub fn setup(config: &LoggerConfig) -> Result<(), fern::InitError> {
    let colors = ColoredLevelConfig::new()
        .info(Color::Green)
        .warn(Color::Yellow)
        .error(Color::Red)
        .debug(Color::Blue)
        .trace(Color::Magenta);

    let disable_colors = config.disable_colors;
    let mut dispatch = fern::Dispatch::new()
        .format(move |out, message, record| {
            let level = if disable_colors {
                record.level().to_string()
            } else {
                colors.color(record.level()).to_string()
            };
            out.finish(format_args!(
                "{} [{:>5}] [{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                level,
                record.target(),
                message
            ))
        })
        .level(config.level)
        .level_for("sqlx", LevelFilter::Warn)
        .level_for("hyper", LevelFilter::Warn)
        .level_for("reqwest", LevelFilter::Warn)
        .level_for("actix_server", LevelFilter::Warn)
        .chain(std::io::stdout());

    if !config.disable_file_logging {
        std::fs::create_dir_all(&config.logs_path)?;
        let prefix = format!("{}{}.", config.logs_path, config.filename_log);
        dispatch = dispatch.chain(fern::DateBased::new(prefix, "%Y-%m-%d"));
    }

    dispatch.apply()?;
    Ok(())
}
