use std::path::{Path, PathBuf};
use std::process::ExitCode;

use media_encapsuler::{
    find_orphaned_sessions, get_atom, get_pvat_string, rewrite_pvat_dates, try_fix_media_file, video_timescale,
    EncapsulerError, EncapsulerResult, Logger,
};

const USAGE: &str = "usage:
  media-encapsuler recover [DIR]        finalize unfinished recordings (default: videos directory)
  media-encapsuler atom FILE PATH       print the size of a box payload, e.g. moov/2:trak/tkhd
  media-encapsuler pvat FILE            print the pvat JSON
  media-encapsuler set-date FILE DATE   rewrite the pvat run and media dates
  media-encapsuler timescale FILE       print the video track timescale";

fn recover(dir: &Path, logger: &Logger) -> EncapsulerResult<()> {
    let sessions = find_orphaned_sessions(dir)?;
    if sessions.is_empty() {
        log::info!("No unfinished recordings in {}", dir.display());
    }
    for info in sessions {
        match try_fix_media_file(&info, logger) {
            Ok(output) => println!("{}", output.display()),
            Err(e) => log::error!("{}: {e}", info.display()),
        }
    }
    Ok(())
}

fn run(args: &[String]) -> EncapsulerResult<()> {
    let logger = Logger::global();
    match args {
        [cmd] if cmd == "recover" => {
            let dir = dirs::video_dir()
                .ok_or_else(|| EncapsulerError::BadParameter("cannot determine the videos directory".into()))?;
            recover(&dir, &logger)
        }
        [cmd, dir] if cmd == "recover" => recover(&PathBuf::from(dir), &logger),
        [cmd, file, path] if cmd == "atom" => {
            let payload = get_atom(Path::new(file), path)?;
            println!("{path}: {} bytes", payload.len());
            Ok(())
        }
        [cmd, file] if cmd == "pvat" => {
            println!("{}", get_pvat_string(Path::new(file))?);
            Ok(())
        }
        [cmd, file, date] if cmd == "set-date" => rewrite_pvat_dates(Path::new(file), date),
        [cmd, file] if cmd == "timescale" => {
            println!("{}", video_timescale(Path::new(file))?);
            Ok(())
        }
        _ => Err(EncapsulerError::BadParameter(USAGE.into())),
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
