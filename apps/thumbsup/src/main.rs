use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use ron::ser::PrettyConfig;
use serde::Serialize;
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};
use std::path::PathBuf;
use thumbsup::sim::{build_sim_controller, run_script, Script};
use thumbsup::FileBlobStore;
use thumbsup_core::config::{read_configuration, RobotConfig};
use thumbsup_core::hw::BlobStore;
use thumbsup_core::{TuError, TuResult};
use tu_drive::TrimCalibrator;
use tu_sim::{MemoryBlobStore, SimBoard};

#[derive(Parser)]
#[command(author, version, about = "ThumbsUp control core on the simulated board", long_about = None)]
struct Cli {
    /// RON configuration, one section per component
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Blob store directory holding the persisted trim
    #[arg(long, global = true, value_name = "DIR")]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control loop against a scripted gamepad
    Simulate {
        #[arg(long, value_enum, default_value_t = Script::ArmAndSpin)]
        script: Script,
        /// Number of 10 ms ticks, the script length when omitted
        #[arg(long)]
        ticks: Option<u64>,
    },
    /// Run the boot safety suite
    Selftest,
    /// Put the simulated AM32 into config mode and apply the weapon defaults
    EscDefaults,
    /// Print the persisted trim curve
    TrimShow,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("thumbsup failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> TuResult<()> {
    let cli = Cli::parse();
    TermLogger::init(
        cli.log_level.into(),
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .map_err(|e| TuError::new_with_cause("Failed to install the terminal logger", e))?;

    let config = match &cli.config {
        Some(path) => read_configuration(&path.to_string_lossy())?,
        None => RobotConfig::default(),
    };

    match cli.command {
        Command::Simulate { script, ticks } => {
            let ticks = ticks.unwrap_or_else(|| script.default_ticks());
            match &cli.store {
                Some(dir) => simulate(FileBlobStore::open(dir)?, &config, script, ticks),
                None => simulate(MemoryBlobStore::new(), &config, script, ticks),
            }
        }
        Command::Selftest => {
            let board = SimBoard::new();
            let mut controller = build_sim_controller(&board, MemoryBlobStore::new(), &config)?;
            let booted = controller.boot();
            if let Some(report) = controller.self_test_report() {
                println!("{report}");
            }
            booted
        }
        Command::EscDefaults => esc_defaults(&config),
        Command::TrimShow => {
            let dir = cli
                .store
                .ok_or_else(|| TuError::from("trim-show needs --store <DIR>"))?;
            trim_show(&FileBlobStore::open(dir)?)
        }
    }
}

fn simulate<S: BlobStore>(
    store: S,
    config: &RobotConfig,
    script: Script,
    ticks: u64,
) -> TuResult<()> {
    let board = SimBoard::new();
    let mut controller = build_sim_controller(&board, store, config)?;
    controller.boot()?;
    let summary = run_script(&mut controller, &board, script, ticks)?;
    println!("{summary}");
    Ok(())
}

fn to_ron<T: Serialize>(value: &T) -> TuResult<String> {
    ron::ser::to_string_pretty(value, PrettyConfig::default())
        .map_err(|e| TuError::new_with_cause("Failed to serialize to RON", e))
}

fn esc_defaults(config: &RobotConfig) -> TuResult<()> {
    let board = SimBoard::new();
    let mut controller = build_sim_controller(&board, MemoryBlobStore::new(), config)?;
    let weapon = controller.weapon_mut();
    weapon.enter_config_mode()?;
    let result = (|| -> TuResult<()> {
        let esc_info = weapon.esc_info()?;
        println!("{}", to_ron(&esc_info)?);
        let before = weapon.read_esc_settings()?;
        let after = weapon.apply_esc_weapon_defaults()?;
        println!("before:\n{}", to_ron(&before)?);
        println!("after:\n{}", to_ron(&after)?);
        Ok(())
    })();
    weapon.enable_pwm()?;
    info!("ESC back on pwm");
    result
}

fn trim_show(store: &impl BlobStore) -> TuResult<()> {
    let mut trim = TrimCalibrator::new();
    let points = trim.load(store)?;
    if points == 0 {
        println!("no trim stored, driving untrimmed");
        return Ok(());
    }
    println!("{}", to_ron(&trim.fitted())?);
    for speed in [-100, -50, -25, 25, 50, 100] {
        println!("speed {speed:>4}%: turn offset {:>3}%", trim.get_offset(speed));
    }
    Ok(())
}
