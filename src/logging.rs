use common::util;
use flate2::{write::GzEncoder, Compression};
use log::*;
use log4rs::{
    append::{
        console::{ConsoleAppender, Target},
        rolling_file::{
            policy::compound::{roll::Roll, trigger::size::SizeTrigger, CompoundPolicy},
            RollingFileAppender,
        },
    },
    config::{Appender, Config, Root},
    encode::{self, Encode},
    filter::{Filter, Response},
};
use std::io::Write;
use std::{
    borrow::Cow,
    fmt::{self, Display, Formatter},
    fs::{self, read_dir, remove_file, rename, File},
    io,
    path::{Component, Path, PathBuf},
    sync::Mutex,
    thread,
};
use time::OffsetDateTime;

const FILE_SIZE_LIMIT: u64 = 50_000_000;
const LATEST_LOG: &str = "latest.log";
const CRATES: [&str; 4] = ["cache", "common", "entity", "ig_cache"];

/// Sends records from this workspace to stdout and to a size-rolled file in `directory`.
pub fn init_logger(directory: &Path, level: LevelFilter) -> Result<(), anyhow::Error> {
    fs::create_dir_all(directory)?;

    let console = ConsoleAppender::builder()
        .encoder(Box::new(LogEncoder))
        .target(Target::Stdout)
        .build();

    let log_file = RollingFileAppender::builder()
        .encoder(Box::new(LogEncoder))
        .build(
            directory.join(LATEST_LOG),
            Box::new(CompoundPolicy::new(
                Box::new(SizeTrigger::new(FILE_SIZE_LIMIT)),
                Box::new(GzipRoller::new(directory)),
            )),
        )?;

    let config = Config::builder()
        .appender(
            Appender::builder()
                .filter(Box::new(CrateFilter))
                .build("console", Box::new(console)),
        )
        .appender(
            Appender::builder()
                .filter(Box::new(CrateFilter))
                .build("log_file", Box::new(log_file)),
        )
        .build(
            Root::builder()
                .appender("console")
                .appender("log_file")
                .build(level),
        )?;

    log4rs::init_config(config)?;

    Ok(())
}

// Called at the end of main, compresses the last log file
pub fn cleanup(directory: &Path) {
    let _ = GzipRoller::new(directory).roll_threaded(&directory.join(LATEST_LOG), false);
}

fn current_time() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

fn format_time(datetime: OffsetDateTime) -> String {
    match datetime.format(&*util::TIME_FORMAT) {
        Ok(formatted) => formatted,
        Err(_) => "??:??:??".to_owned(),
    }
}

// sqlx logs every statement at info level, keep it out
#[derive(Debug)]
struct CrateFilter;

impl Filter for CrateFilter {
    fn filter(&self, record: &Record) -> Response {
        match record.module_path() {
            Some(path) if CRATES.iter().any(|&krate| path.starts_with(krate)) => {
                Response::Accept
            }
            _ => Response::Reject,
        }
    }
}

/// Rolls `latest.log` into `{date}-{index}.log.gz`.
#[derive(Debug)]
struct GzipRoller {
    directory: PathBuf,
    name_info: Mutex<(u16, u32)>, // current day, log count for today
}

impl GzipRoller {
    fn new(directory: &Path) -> Self {
        let today = current_time()
            .format(&*util::DATE_FORMAT)
            .unwrap_or_default();

        // Logs are named {date}-{index}.log.gz, continue after the highest index of today
        let max_index = read_dir(directory)
            .into_iter()
            .flatten()
            .flatten()
            .flat_map(|entry| entry.file_name().into_string())
            .filter(|name| name.starts_with(&today))
            .filter_map(|name| Self::index_from_name(&name))
            .max()
            .unwrap_or(0);

        Self {
            directory: directory.to_owned(),
            name_info: Mutex::new((current_time().ordinal(), max_index)),
        }
    }

    fn index_from_name(name: &str) -> Option<u32> {
        let dash_index = name.rfind('-')?;
        let dot_index = name.find('.')?;
        name.get(dash_index.saturating_add(1)..dot_index)
            .and_then(|index| index.parse::<u32>().ok())
    }

    fn roll_threaded(&self, file: &Path, threaded: bool) -> Result<(), anyhow::Error> {
        let local_datetime = current_time();
        let index = {
            let mut guard = self
                .name_info
                .lock()
                .map_err(|_| anyhow::anyhow!("Log roller mutex poisoned"))?;

            if local_datetime.ordinal() != guard.0 {
                *guard = (local_datetime.ordinal(), 1);
            } else {
                guard.1 = guard.1.wrapping_add(1);
            }
            guard.1
        };

        // Rename first so the appender can reopen latest.log while we compress
        let staged = self.directory.join("latest-tmp.log");
        rename(file, &staged)?;

        let output = self.directory.join(format!(
            "{}-{index}.log.gz",
            local_datetime.format(&*util::DATE_FORMAT)?
        ));

        if threaded {
            thread::spawn(move || Self::try_compress_log(&staged, &output));
        } else {
            Self::try_compress_log(&staged, &output);
        }

        Ok(())
    }

    fn try_compress_log(input_path: &Path, output_path: &Path) {
        if let Err(error) = Self::compress_log(input_path, output_path) {
            error!("Failed to compress log file: {error:?}");
        }
    }

    fn compress_log(input_path: &Path, output_path: &Path) -> Result<(), io::Error> {
        let mut input = File::open(input_path)?;
        let mut output = GzEncoder::new(File::create(output_path)?, Compression::default());
        io::copy(&mut input, &mut output)?;
        drop(output.finish()?);
        drop(input); // Some platforms refuse to delete an open file
        remove_file(input_path)
    }
}

impl Roll for GzipRoller {
    fn roll(&self, file: &Path) -> Result<(), anyhow::Error> {
        self.roll_threaded(file, true)
    }
}

#[derive(Debug)]
struct LogEncoder;

impl Encode for LogEncoder {
    fn encode(&self, writer: &mut dyn encode::Write, record: &Record<'_>) -> anyhow::Result<()> {
        let location = Location::from_record(record);
        let separator = match location {
            Location::Some { .. } => " ",
            Location::None => "",
        };

        writeln!(
            writer,
            "[{} {}{separator}{location}]: {}",
            format_time(current_time()),
            record.metadata().level(),
            record.args()
        )
        .map_err(Into::into)
    }
}

enum Location<'a> {
    None,
    Some { file: Cow<'a, str>, line: u32 },
}

impl<'a> Location<'a> {
    fn from_record(record: &Record<'a>) -> Self {
        let (file, line) = match record.level() {
            Level::Info | Level::Warn => return Self::None,
            _ => match (record.file(), record.line()) {
                (Some(file), Some(line)) => (file, line),
                _ => return Self::None,
            },
        };

        let truncated = Path::new(file)
            .components()
            .skip_while(|component| {
                matches!(
                    component,
                    Component::Prefix(_)
                        | Component::RootDir
                        | Component::CurDir
                        | Component::ParentDir
                ) || component == &Component::Normal("src".as_ref())
            })
            .collect::<PathBuf>();

        match truncated.into_os_string().into_string() {
            Ok(string) => Self::Some {
                file: Cow::Owned(string),
                line,
            },
            Err(_) => Self::Some {
                file: Cow::Borrowed(file),
                line,
            },
        }
    }
}

impl Display for Location<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => Ok(()),
            Self::Some { file, line } => write!(f, "{file}:{line}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolled_log_indices() {
        assert_eq!(GzipRoller::index_from_name("2024-03-01-7.log.gz"), Some(7));
        assert_eq!(GzipRoller::index_from_name("latest.log"), None);
    }
}
