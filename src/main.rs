use std::{collections::HashMap, time::Duration};

use clap::{App, AppSettings, Arg, SubCommand};

mod simulation;

pub use simulation::*;

use crate::{
    floating_type_mod::FT,
    scene::build_scene,
    simulation_parameters::SimulationParams,
    sph_kernels::{DimensionUtils, DimensionUtils2d, DimensionUtils3d},
};

const CARGO_PKG_AUTHORS: &'static str = env!("CARGO_PKG_AUTHORS");
const CARGO_PKG_VERSION: &'static str = env!("CARGO_PKG_VERSION");
const CARGO_PKG_DESCRIPTION: &'static str = env!("CARGO_PKG_DESCRIPTION");

fn main() {
    let matches = App::new("Projective SPH Simulation")
        .version(CARGO_PKG_VERSION)
        .author(CARGO_PKG_AUTHORS)
        .about(CARGO_PKG_DESCRIPTION)
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(
            SubCommand::with_name("run")
                .about("Run simulation with given config")
                .arg(
                    Arg::with_name("SIMULATION_CONFIG")
                        .help("Sets the simulation parameters")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::with_name("SCENE_CONFIG")
                        .help("Scene setup")
                        .required(true)
                        .index(2),
                )
                .arg(
                    Arg::with_name("MAX_SECONDS")
                        .long("max-seconds")
                        .short("s")
                        .required(false)
                        .takes_value(true)
                        .help("Stop simulation after the given amount of simulated seconds"),
                )
                .arg(
                    Arg::with_name("MAX_STEPS")
                        .long("max-steps")
                        .short("n")
                        .required(false)
                        .takes_value(true)
                        .help("Stop simulation after the given number of steps"),
                )
                .arg(
                    Arg::with_name("OVERWRITE_CONFIG_FILE")
                        .long("overwrite-config-file")
                        .short("c")
                        .required(false)
                        .takes_value(true)
                        .help("Overwrite config"),
                )
                .arg(
                    Arg::with_name("STATISTICS_ENABLED")
                        .help("Print per-step solver statistics")
                        .short("p")
                        .long("statistics-enabled")
                        .takes_value(false),
                ),
        )
        .get_matches();

    if let Some(run_matches) = matches.subcommand_matches("run") {
        let parameter_file = run_matches
            .value_of("SIMULATION_CONFIG")
            .expect("missing simulation config");
        let params_yaml = std::fs::read_to_string(parameter_file).expect("failed reading parameter file");
        let mut simulation_params_serde: serde_yaml::Value =
            serde_yaml::from_str(&params_yaml).expect("failed parsing simulation config file");

        if let Some(overwrite_value_config) = run_matches.value_of("OVERWRITE_CONFIG_FILE") {
            let overwrite_config_str =
                std::fs::read_to_string(overwrite_value_config).expect("failed reading parameter file");
            let overwrite_config_file: HashMap<String, serde_yaml::Value> =
                serde_yaml::from_str(&overwrite_config_str).expect("failed parsing simulation config file");
            for (k, v) in overwrite_config_file.into_iter() {
                let mapping = simulation_params_serde
                    .as_mapping_mut()
                    .expect("cannot get parsed simulation parameters as mapping");
                *mapping
                    .get_mut(&serde_yaml::Value::String(k.clone()))
                    .unwrap_or_else(|| panic!("not able to find attribute {}", k)) = v;
            }
        }

        let simulation_params: SimulationParams =
            serde_yaml::from_value(simulation_params_serde).expect("failed to unpack SimulationParams");
        println!("{:?}", simulation_params);

        let scene_file_path = run_matches.value_of("SCENE_CONFIG").expect("missing scene config");
        let scene_yaml = std::fs::read_to_string(scene_file_path).expect("failed reading scene file");
        let scene_config: SceneConfig = serde_yaml::from_str(&scene_yaml).expect("failed parsing scene config file");
        println!("{:?}", scene_config);

        let max_seconds = run_matches.value_of("MAX_SECONDS").map(|x| x.parse::<FT>().unwrap());
        let max_steps = run_matches.value_of("MAX_STEPS").map(|x| x.parse::<usize>().unwrap());
        let statistics_enabled = run_matches.is_present("STATISTICS_ENABLED");

        match scene_config.dimension {
            2 => fluid_main::<DimensionUtils2d, 2>(
                simulation_params,
                &scene_config,
                max_seconds,
                max_steps,
                statistics_enabled,
            ),
            3 => fluid_main::<DimensionUtils3d, 3>(
                simulation_params,
                &scene_config,
                max_seconds,
                max_steps,
                statistics_enabled,
            ),
            d => panic!("unsupported scene dimension {}", d),
        }
    } else {
        unreachable!()
    }
}

fn fluid_main<DU: DimensionUtils<D>, const D: usize>(
    simulation_params: SimulationParams,
    scene_config: &SceneConfig,
    max_seconds: Option<FT>,
    max_steps: Option<usize>,
    statistics_enabled: bool,
) {
    let mut model = build_scene::<DU, D>(scene_config, simulation_params);
    let mut solver = TimeStepProjective::<DU, D>::new(model.num_fluid_particles());

    println!("INIT {} FLUID PARTICLES", model.num_fluid_particles());

    let mut total_duration: Duration = Duration::from_nanos(0);
    let mut frame_number: u32 = 0;

    loop {
        if let Some(max_steps) = max_steps {
            if frame_number as usize >= max_steps {
                break;
            }
        }
        if let Some(max_seconds) = max_seconds {
            if solver.time >= max_seconds {
                break;
            }
        }

        let a = std::time::Instant::now();
        solver.step(&mut model, simulation_params);
        let b = std::time::Instant::now();

        total_duration += b - a;
        frame_number += 1;

        println!(
            "{:05}: {} fluid particles t={:.4}s {}msec ({}msec AVG)",
            frame_number,
            model.num_fluid_particles(),
            solver.time,
            (b - a).as_secs_f32() * 1000.,
            (total_duration / frame_number).as_secs_f32() * 1000.
        );

        if statistics_enabled {
            println!(
                "       solve: {} pd iterations, {} cg iterations, outcome {:?}",
                solver.last_solve.pd_iterations, solver.last_solve.cg_iterations, solver.last_solve.final_state
            );
        }
    }

    println!(
        "DONE after {} steps ({}s simulated, {}msec total)",
        frame_number,
        solver.time,
        total_duration.as_secs_f32() * 1000.
    );
}
