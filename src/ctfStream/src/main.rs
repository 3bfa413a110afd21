mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use gumdrop::Options;

use ctf_stream::logging::{self, ResultExt};


#[derive(Debug, Options)]
struct Args {

	/// print help message
	#[options()]
	help: bool,

	/// settings for log output
	#[options(default = "ctf_stream=info")]
	log: String,

	/// append log output to this file instead of stderr
	#[options(no_short)]
	log_file: Option<PathBuf>,

	#[options(command)]
	cmd: Option<Command>
}


#[derive(Debug, Options)]
enum Command {

	/// estimate CTFs for micrographs as they arrive, until the input stream closes
	Run(ArgsRun),

	/// show the state of the input and output sets
	Status(ArgsProject),

	/// check the config file
	Validate(ArgsProject),

	/// add micrographs to the input set
	AddMics(ArgsAddMics),

	/// close the input set, no more micrographs will arrive
	CloseMics(ArgsProject),

	/// fit a published micrograph's CTF again from its PSD, starting from corrected defoci
	Recalc(ArgsRecalc)
}


#[derive(Debug, Options)]
pub struct ArgsProject {

	/// print help message
	#[options()]
	help: bool,

	/// the project folder, with the ctf.toml file
	#[options(default = ".")]
	project: PathBuf
}


#[derive(Debug, Options)]
pub struct ArgsRun {

	/// print help message
	#[options()]
	help: bool,

	/// the project folder, with the ctf.toml file
	#[options(default = ".")]
	project: PathBuf,

	/// only run what the input has now, don't wait for more micrographs
	#[options()]
	once: bool
}


#[derive(Debug, Options)]
pub struct ArgsAddMics {

	/// print help message
	#[options()]
	help: bool,

	/// the project folder, with the ctf.toml file
	#[options(default = ".")]
	project: PathBuf,

	/// in A/px, needed when the input set doesn't exist yet
	#[options()]
	sampling_rate: Option<f64>,

	/// in kV, needed when the input set doesn't exist yet
	#[options()]
	voltage: Option<f64>,

	/// spherical aberration in mm, needed when the input set doesn't exist yet
	#[options()]
	cs: Option<f64>,

	/// needed when the input set doesn't exist yet
	#[options()]
	amplitude_contrast: Option<f64>,

	/// micrograph files to add
	#[options(free)]
	micrographs: Vec<PathBuf>
}


#[derive(Debug, Options)]
pub struct ArgsRecalc {

	/// print help message
	#[options()]
	help: bool,

	/// the project folder, with the ctf.toml file
	#[options(default = ".")]
	project: PathBuf,

	/// corrected defocus U, in A
	#[options(no_short)]
	defocus_u: Option<f64>,

	/// corrected defocus V, in A
	#[options(no_short)]
	defocus_v: Option<f64>,

	/// corrected astigmatism angle, in degrees
	#[options()]
	angle: Option<f64>,

	/// lowest frequency to fit, defaults to the config's
	#[options(no_short)]
	low_res: Option<f64>,

	/// highest frequency to fit, defaults to the config's
	#[options(no_short)]
	high_res: Option<f64>,

	/// name of the micrograph
	#[options(free)]
	micrograph: Option<String>
}


fn main() -> ExitCode {

	// parse arguments
	let args = Args::parse_args_default_or_exit();

	// init logging
	let Ok(_) = logging::init(&args.log, args.log_file.as_deref())
		.log_err()
		else { return ExitCode::FAILURE; };

	// handle the commands
	let result = match args.cmd {
		Some(Command::Run(args)) => commands::run::run(args),
		Some(Command::Status(args)) => commands::status::run(args),
		Some(Command::Validate(args)) => commands::validate::run(args),
		Some(Command::AddMics(args)) => commands::mics::add(args),
		Some(Command::CloseMics(args)) => commands::mics::close(args),
		Some(Command::Recalc(args)) => commands::recalc::run(args),
		None => {
			println!("No command given");
			return ExitCode::FAILURE;
		}
	};

	let Ok(_) = result
		.log_err()
		else { return ExitCode::FAILURE; };

	// we finished! =)
	ExitCode::SUCCESS
}
