use console::style;
use env_logger::{Builder, Env};
use log::{Level, LevelFilter};
use std::io::Write;

/// Initialize logger based on verbose flag. `RUST_LOG` still takes precedence.
pub fn init_logger(verbose: bool) {
    let default = level_for(verbose);
    let env = Env::default().filter_or("RUST_LOG", default.as_str().to_lowercase());

    Builder::new()
        .filter_level(default)
        .parse_env(env)
        .format(|buf, record| {
            let level = match record.level() {
                Level::Error => format!("{}", style("ERROR").red().bold()),
                Level::Warn => format!("{}", style("WARN ").yellow().bold()),
                Level::Info => format!("{}", style("INFO ").green()),
                Level::Debug => format!("{}", style("DEBUG").cyan()),
                Level::Trace => format!("{}", style("TRACE").dim()),
            };
            writeln!(
                buf,
                "{} {} {}",
                level,
                style(record.target()).dim(),
                record.args()
            )
        })
        .init();
}

fn level_for(verbose: bool) -> LevelFilter {
    if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    }
}
