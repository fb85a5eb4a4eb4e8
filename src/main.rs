use std::env;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context};
use tracing::info;

use rover_conference::config::ConferenceConfig;
use rover_conference::dispatcher::{self, Dispatcher};
use rover_conference::graph::InMemoryGraph;
use rover_conference::model::codec::MediaType;
use rover_conference::model::identity::CNAME;
use rover_conference::model::stream::Direction;
use rover_conference::transport::{TransmitterKind, UdpTransport};
use rover_conference::util::{default_cname, init_log};
use rover_conference::Conference;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 3 || args.len() > 4 {
        print_usage();
        return Ok(());
    }

    init_log();

    let config = match args.get(3) {
        Some(path) => ConferenceConfig::load(Path::new(path))?,
        None => ConferenceConfig::default(),
    };

    let (events, queue) = dispatcher::channel(config.queue_size);
    let transport = Arc::new(UdpTransport::with_events(events.clone()));

    let mut conference = Conference::new(config.clone(), Arc::new(InMemoryGraph::new()));
    for kind in [TransmitterKind::Multicast, TransmitterKind::RawUdp, TransmitterKind::Nice] {
        conference.register_transmitter(kind, transport.clone());
    }
    conference.create()?;
    conference.set_identity([(CNAME, default_cname(&args[1]))]);

    let track = conference.add_track(MediaType::Video)?.id();
    let participant = conference.add_participant()?.id();

    let stream = conference.new_stream(track, participant, Direction::Both)?;
    stream
        .set_transmitter(config.transmitter)
        .context("selecting transmitter")?;
    stream
        .set_remote_codecs(config.remote_codecs.clone())
        .context("applying remote codecs")?;
    stream
        .force_remote_candidates(config.remote_candidates.clone())
        .context("forcing remote candidates")?;
    info!("Stream {} is {:?}", stream.key(), stream.state());

    conference
        .attach_producer(track, &format!("{} ! videoscale", args[2]))
        .context("attaching local source")?;
    conference.start()?;

    let mut dispatcher = Dispatcher::new(conference, queue);
    let handle = thread::spawn(move || {
        dispatcher.run();
        dispatcher.into_conference()
    });

    info!("Running, press Ctrl-C to leave");
    tokio::signal::ctrl_c().await?;

    events.stop()?;
    let mut conference = handle
        .join()
        .map_err(|_| anyhow!("dispatcher thread panicked"))?;
    conference.stop()?;

    Ok(())
}

fn print_usage() {
    println!("Rover Conference");
    println!("Usage:");
    println!("  rover-conference <identity> <source-description> [config.json]");
    println!();
    println!("  identity            user part of the cname, e.g. 'rover'");
    println!("  source-description  local producer, e.g. 'videotestsrc'");
}
