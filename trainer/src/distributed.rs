use std::{io, num::NonZeroUsize, thread};

use comms::{Collective, LocalGroup, Solo, TcpGroup};
use log::info;
use machine_learning::MlErr;

use crate::{
    Result, TrainErr,
    config::{DistUrl, RunConfig},
};

/// How the ranks of a run are laid out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topology {
    /// A single, non-distributed process.
    Single,
    /// Every rank is a thread of this process.
    Threads(NonZeroUsize),
    /// This process is one rank of a group meeting at `addr`.
    Tcp {
        rank: usize,
        world_size: usize,
        local_rank: usize,
        addr: String,
    },
}

impl Topology {
    /// Resolves the topology from the config and the launcher's environment.
    ///
    /// `RANK` and `WORLD_SIZE` make this process a TCP rank, its rendezvous is
    /// either the `tcp://` url or `MASTER_ADDR:MASTER_PORT`. Without them a
    /// `local://` url with a world size above one spawns threads.
    ///
    /// # Arguments
    /// * `config` - The run's configuration.
    /// * `var` - Looks up an environment variable.
    pub fn from_env(config: &RunConfig, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let parse = |name: &str| -> Result<Option<usize>> {
            var(name)
                .map(|v| {
                    v.trim().parse().map_err(|_| {
                        TrainErr::InvalidConfig(format!("{name} must be a number, got {v}"))
                    })
                })
                .transpose()
        };

        if let (Some(rank), Some(world_size)) = (parse("RANK")?, parse("WORLD_SIZE")?) {
            if rank >= world_size {
                return Err(TrainErr::InvalidConfig(format!(
                    "RANK {rank} is out of range for WORLD_SIZE {world_size}"
                )));
            }

            let local_rank = parse("LOCAL_RANK")?.or(config.local_rank).unwrap_or(0);
            let addr = match &config.dist_url {
                DistUrl::Tcp(addr) => addr.clone(),
                DistUrl::Env | DistUrl::Local => {
                    let (Some(host), Some(port)) = (var("MASTER_ADDR"), var("MASTER_PORT")) else {
                        return Err(TrainErr::InvalidConfig(
                            "MASTER_ADDR and MASTER_PORT must be set for env:// rendezvous".into(),
                        ));
                    };
                    format!("{host}:{port}")
                }
            };

            return Ok(Self::Tcp {
                rank,
                world_size,
                local_rank,
                addr,
            });
        }

        if config.dist_url == DistUrl::Local && config.world_size.get() > 1 {
            return Ok(Self::Threads(config.world_size));
        }

        Ok(Self::Single)
    }

    pub fn world_size(&self) -> usize {
        match self {
            Self::Single => 1,
            Self::Threads(n) => n.get(),
            Self::Tcp { world_size, .. } => *world_size,
        }
    }

    /// Runs `run` once per local rank, each with its own handle to the group.
    ///
    /// # Returns
    /// The coordinator's result when it is local, otherwise this rank's. With
    /// threads the error of the rank that failed first in rank order wins over
    /// the ones raised because it left the group.
    pub fn launch<T, F>(self, run: F) -> Result<T>
    where
        T: Send,
        F: Fn(Box<dyn Collective>) -> Result<T> + Sync,
    {
        match self {
            Self::Single => {
                info!("not using distributed mode");
                run(Box::new(Solo))
            }
            Self::Threads(world_size) => {
                info!(world_size = world_size.get(); "spawning one thread per rank");
                let run = &run;

                let results: Vec<Result<T>> = thread::scope(|s| {
                    let handles: Vec<_> = LocalGroup::new(world_size)
                        .into_iter()
                        .enumerate()
                        .map(|(rank, group)| {
                            thread::Builder::new()
                                .name(format!("rank-{rank}"))
                                .spawn_scoped(s, move || run(Box::new(group)))
                        })
                        .collect::<io::Result<_>>()?;

                    Ok::<_, TrainErr>(
                        handles
                            .into_iter()
                            .enumerate()
                            .map(|(rank, h)| {
                                h.join().unwrap_or_else(|_| {
                                    Err(io::Error::other(format!("rank {rank} panicked")).into())
                                })
                            })
                            .collect(),
                    )
                })?;

                let mut coordinator = None;
                let mut failure: Option<TrainErr> = None;
                for result in results {
                    match result {
                        Ok(value) => {
                            coordinator.get_or_insert(value);
                        }
                        Err(e) => {
                            // the cause beats the ranks that only saw it leave
                            if failure.as_ref().is_none_or(left_the_group) {
                                failure = Some(e);
                            }
                        }
                    }
                }

                match failure {
                    Some(e) => Err(e),
                    None => coordinator.ok_or_else(|| io::Error::other("no rank was spawned").into()),
                }
            }
            Self::Tcp {
                rank,
                world_size,
                local_rank,
                addr,
            } => {
                info!(rank = rank, local_rank = local_rank; "joining process group at {addr}");
                let group = TcpGroup::connect(addr.as_str(), rank, world_size)?;
                run(Box::new(group))
            }
        }
    }
}

/// Whether `e` only reports that another rank abandoned the group.
fn left_the_group(e: &TrainErr) -> bool {
    let io = match e {
        TrainErr::Io(e) | TrainErr::Ml(MlErr::Io(e)) => e,
        _ => return false,
    };

    io.kind() == io::ErrorKind::ConnectionAborted
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use clap::Parser;

    use super::*;
    use crate::cli::Args;

    fn config(flags: &[&str]) -> RunConfig {
        let argv: Vec<&str> = ["snn-mixer-train", "--epochs", "20"].into_iter().chain(flags.iter().copied()).collect();
        RunConfig::from_args(Args::try_parse_from(&argv).unwrap(), Vec::new()).unwrap()
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn no_launcher_variables_means_a_single_process() {
        let topology = Topology::from_env(&config(&[]), env(&[])).unwrap();
        assert_eq!(topology, Topology::Single);
        assert_eq!(topology.world_size(), 1);
    }

    #[test]
    fn local_url_spawns_threads() {
        let topology = Topology::from_env(
            &config(&["--dist-url", "local://", "--world-size", "3"]),
            env(&[]),
        )
        .unwrap();
        assert_eq!(topology, Topology::Threads(NonZeroUsize::new(3).unwrap()));
    }

    #[test]
    fn env_rendezvous_reads_master_address() {
        let vars = env(&[
            ("RANK", "1"),
            ("WORLD_SIZE", "2"),
            ("LOCAL_RANK", "1"),
            ("MASTER_ADDR", "127.0.0.1"),
            ("MASTER_PORT", "29500"),
        ]);
        let topology = Topology::from_env(&config(&[]), vars).unwrap();

        assert_eq!(
            topology,
            Topology::Tcp {
                rank: 1,
                world_size: 2,
                local_rank: 1,
                addr: "127.0.0.1:29500".into(),
            }
        );
    }

    #[test]
    fn bad_launcher_variables_are_rejected() {
        for pairs in [
            &[("RANK", "2"), ("WORLD_SIZE", "2"), ("MASTER_ADDR", "h"), ("MASTER_PORT", "1")][..],
            &[("RANK", "0"), ("WORLD_SIZE", "2")],
            &[("RANK", "x"), ("WORLD_SIZE", "2")],
        ] {
            assert!(matches!(
                Topology::from_env(&config(&[]), env(pairs)),
                Err(TrainErr::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn threads_return_the_coordinators_result() {
        let topology = Topology::Threads(NonZeroUsize::new(3).unwrap());
        let out = topology
            .launch(|mut group| {
                let mut buf = [group.rank() as f32 + 1.];
                group.all_reduce_sum(&mut buf)?;
                Ok((group.rank(), buf[0]))
            })
            .unwrap();

        assert_eq!(out, (0, 6.));
    }

    #[test]
    fn a_failing_thread_rank_does_not_hang_the_others() {
        let topology = Topology::Threads(NonZeroUsize::new(3).unwrap());
        let out = topology.launch(|mut group| {
            if group.rank() == 1 {
                return Err(TrainErr::Checkpoint("disk full".into()));
            }

            for _ in 0..3 {
                group.barrier()?;
            }
            Ok(group.rank())
        });

        assert!(matches!(out, Err(TrainErr::Checkpoint(msg)) if msg == "disk full"));
    }
}
