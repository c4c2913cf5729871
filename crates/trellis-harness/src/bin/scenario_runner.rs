use anyhow::Result;
use trellis_harness::{
    run_migration, run_scenario, MigrationConfig, PathIdVariant, ScenarioConfig, ScenarioKind,
};

const KINDS: &[(&str, ScenarioKind)] = &[
    ("basic", ScenarioKind::Basic),
    ("drop-first", ScenarioKind::DropFirst),
    ("drop-second", ScenarioKind::DropSecond),
    ("sat-plus", ScenarioKind::SatPlus),
    ("perf", ScenarioKind::Perf),
    ("renew", ScenarioKind::Renew),
    ("nat", ScenarioKind::Nat),
    ("break1", ScenarioKind::Break1),
    ("break2", ScenarioKind::Break2),
    ("back1", ScenarioKind::Back1),
    ("standby", ScenarioKind::Standby),
    ("standup", ScenarioKind::Standup),
    ("abandon", ScenarioKind::Abandon),
    ("stream-affinity", ScenarioKind::StreamAffinity),
    ("datagram", ScenarioKind::Datagram),
    ("datagram-affinity", ScenarioKind::DatagramAffinity),
    ("tunnel", ScenarioKind::Tunnel),
    ("callback", ScenarioKind::Callback),
];

fn parse_kind(name: &str) -> Result<ScenarioKind> {
    KINDS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, k)| *k)
        .ok_or_else(|| anyhow::anyhow!("unknown scenario: {name}"))
}

fn parse_variant(name: &str) -> Result<PathIdVariant> {
    match name {
        "cid" => Ok(PathIdVariant::Cid),
        "simple" => Ok(PathIdVariant::Simple),
        "unique" => Ok(PathIdVariant::Unique),
        other => anyhow::bail!("unknown variant: {other}"),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    let mut args = std::env::args().skip(1);
    let scenario = args
        .next()
        .unwrap_or_else(|| "help".to_string());

    if scenario == "help" || scenario == "--help" {
        eprintln!("usage: scenario-runner <scenario|migration|all> [cid|simple|unique] [options]");
        eprintln!("scenarios: {}", KINDS.iter().map(|(n, _)| *n).collect::<Vec<_>>().join(", "));
        eprintln!("options: --seed N  --loss MASK  --event-log PATH  --shrink-mtu");
        return Ok(());
    }

    let mut variant = PathIdVariant::Cid;
    let mut seed = None;
    let mut loss_mask = 0u64;
    let mut event_log = None;
    let mut shrink_mtu = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--seed" => {
                seed = Some(args.next().expect("Missing --seed value").parse()?);
            }
            "--loss" => {
                loss_mask = args.next().expect("Missing --loss value").parse()?;
            }
            "--event-log" => {
                event_log = Some(args.next().expect("Missing --event-log value").into());
            }
            "--shrink-mtu" => {
                shrink_mtu = true;
            }
            other => {
                variant = parse_variant(other)?;
            }
        }
    }

    if scenario == "migration" {
        let mut config = MigrationConfig {
            loss_mask,
            shrink_mtu,
            ..Default::default()
        };
        if let Some(seed) = seed {
            config.seed = seed;
        }
        let report = run_migration(&config)?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let kinds: Vec<ScenarioKind> = if scenario == "all" {
        KINDS.iter().map(|(_, k)| *k).collect()
    } else {
        vec![parse_kind(&scenario)?]
    };

    for kind in kinds {
        let mut config = ScenarioConfig::new(kind, variant);
        config.loss_mask = loss_mask;
        config.event_log = event_log.clone();
        if let Some(seed) = seed {
            config.seed = seed;
        }
        let report = run_scenario(&config)?;
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}
