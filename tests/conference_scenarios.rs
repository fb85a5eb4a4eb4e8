use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use parking_lot::Mutex;

use rover_conference::config::ConferenceConfig;
use rover_conference::dispatcher::{self, Dispatcher};
use rover_conference::graph::{InMemoryGraph, MediaGraph, NodeState, PortId};
use rover_conference::model::candidate::{
    CandidateType, ComponentId, NetworkProtocol, TransportCandidate,
};
use rover_conference::model::codec::{Codec, MediaType};
use rover_conference::model::propagated::Propagated;
use rover_conference::model::stream::{Direction, RemoteMedia, StreamKey, StreamState};
use rover_conference::sink::{SharedSinkPool, SinkConfig};
use rover_conference::transport::{ComponentState, TransmitterKind, Transport};
use rover_conference::{Conference, ConferenceError};

/// Accepts every candidate and remembers what it was asked to establish.
#[derive(Default)]
struct RecordingTransport {
    established: Mutex<Vec<TransportCandidate>>,
    released: Mutex<Vec<StreamKey>>,
}

impl Transport for RecordingTransport {
    fn establish(
        &self,
        _key: &StreamKey,
        candidates: &[TransportCandidate],
    ) -> Vec<(ComponentId, ComponentState)> {
        self.established.lock().extend(candidates.iter().cloned());
        candidates
            .iter()
            .map(|c| (c.component(), ComponentState::Ready))
            .collect()
    }

    fn release(&self, key: &StreamKey) {
        self.released.lock().push(*key);
    }
}

fn h263() -> Vec<Codec> {
    vec![Codec::new(96, "H263-1998", MediaType::Video, 90000)]
}

fn multicast_candidates() -> Vec<TransportCandidate> {
    let rtp = TransportCandidate::new(
        "224.0.0.110".parse().unwrap(),
        3442,
        ComponentId::Rtp,
        NetworkProtocol::Udp,
        CandidateType::Multicast,
    )
    .unwrap()
    .with_ttl(1);
    let rtcp = rtp.copy().with_port(3443).with_component(ComponentId::Rtcp);
    vec![rtp, rtcp]
}

fn setup() -> (Conference, Arc<InMemoryGraph>, Arc<RecordingTransport>) {
    let graph = Arc::new(InMemoryGraph::new());
    let transport = Arc::new(RecordingTransport::default());
    let mut conference = Conference::new(ConferenceConfig::default(), graph.clone());
    conference.register_transmitter(TransmitterKind::Multicast, transport.clone());
    conference.create().unwrap();
    (conference, graph, transport)
}

#[test]
fn multicast_stream_with_forced_candidates_connects() {
    let (mut conference, _graph, transport) = setup();

    let track = conference.add_track(MediaType::Video).unwrap().id();
    let participant = conference.add_participant().unwrap().id();
    let stream = conference
        .new_stream(track, participant, Direction::Both)
        .unwrap();

    stream.set_transmitter(TransmitterKind::Multicast).unwrap();
    stream.set_remote_codecs(h263()).unwrap();
    stream.force_remote_candidates(multicast_candidates()).unwrap();

    assert_eq!(stream.state(), StreamState::Connected);
    assert_eq!(stream.negotiated_codec().unwrap().encoding_name(), "H263-1998");

    let established = transport.established.lock();
    assert_eq!(established.len(), 2);
    assert_eq!(established[0].port(), 3442);
    assert_eq!(established[1].port(), 3443);
    assert_eq!(established[1].ttl(), 1);
}

#[test]
fn two_participants_share_one_consumer() {
    let (mut conference, graph, _transport) = setup();

    let track = conference.add_track(MediaType::Video).unwrap().id();
    let mut keys = vec![];
    for _ in 0..2 {
        let participant = conference.add_participant().unwrap().id();
        let stream = conference
            .new_stream(track, participant, Direction::Both)
            .unwrap();
        stream.set_transmitter(TransmitterKind::Multicast).unwrap();
        stream.set_remote_codecs(h263()).unwrap();
        stream.force_remote_candidates(multicast_candidates()).unwrap();
        keys.push(stream.key());
    }

    for (ssrc, key) in keys.iter().enumerate() {
        assert!(conference.source_discovered(*key, ssrc as u32, 96).unwrap());
    }

    let pool = conference.sink_pool();
    assert_eq!(pool.constructions(), 1);
    assert_eq!(graph.nodes_with_description("funnel").len(), 1);
    assert_eq!(graph.nodes_with_description("autovideosink").len(), 1);

    let inputs: HashSet<PortId> = pool.linked_sources().into_iter().map(|s| s.input).collect();
    assert_eq!(inputs.len(), 2);

    let participants: HashSet<_> = pool
        .linked_sources()
        .into_iter()
        .map(|s| s.participant)
        .collect();
    assert_eq!(participants.len(), 2);
}

#[test]
fn empty_remote_codecs_keep_stream_in_init() {
    let (mut conference, _graph, _transport) = setup();

    let track = conference.add_track(MediaType::Video).unwrap().id();
    let participant = conference.add_participant().unwrap().id();
    let stream = conference
        .new_stream(track, participant, Direction::Both)
        .unwrap();

    let err = stream.set_remote_codecs(vec![]).unwrap_err();
    assert!(matches!(err, ConferenceError::NoCodecMatch));
    assert_eq!(stream.state(), StreamState::Init);
}

#[test]
fn transmitter_is_fixed_after_forced_candidates() {
    let (mut conference, _graph, _transport) = setup();

    let track = conference.add_track(MediaType::Video).unwrap().id();
    let participant = conference.add_participant().unwrap().id();
    let stream = conference
        .new_stream(track, participant, Direction::Both)
        .unwrap();

    stream.set_transmitter(TransmitterKind::Multicast).unwrap();
    stream.force_remote_candidates(multicast_candidates()).unwrap();

    let err = stream.set_transmitter(TransmitterKind::Nice).unwrap_err();
    assert!(matches!(err, ConferenceError::InvalidState(_)));
    assert_eq!(stream.transmitter(), Some(TransmitterKind::Multicast));
}

#[test]
fn candidate_copy_leaves_original_untouched() {
    let original = multicast_candidates().remove(0);
    let copy = original
        .copy()
        .with_port(4000)
        .with_ip("224.0.0.111".parse().unwrap());

    assert_eq!(original.port(), 3442);
    assert_eq!(original.ip().to_string(), "224.0.0.110");
    assert_eq!(copy.port(), 4000);
    assert_eq!(copy.component(), original.component());
}

#[test]
fn concurrent_arrivals_build_one_sink() {
    let graph = Arc::new(InMemoryGraph::new());
    let pool = Arc::new(SharedSinkPool::new(SinkConfig::default(), graph.clone()));
    let (mut conference, _, _) = setup();
    let track = conference.add_track(MediaType::Video).unwrap().id();

    let sources: Vec<RemoteMedia> = (0..16)
        .map(|ssrc| {
            let participant = conference.add_participant().unwrap().id();
            let node = graph.instantiate("rtpdepay").unwrap();
            RemoteMedia {
                track,
                participant,
                ssrc,
                port: graph.get_port(node, "src").unwrap(),
                codec: h263().remove(0),
            }
        })
        .collect();

    let barrier = Arc::new(Barrier::new(sources.len()));
    let handles: Vec<_> = sources
        .into_iter()
        .map(|media| {
            let pool = Arc::clone(&pool);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                pool.link_source(&media)
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert_eq!(pool.constructions(), 1);
    assert_eq!(graph.nodes_with_description("funnel").len(), 1);
    assert_eq!(pool.linked_sources().len(), 16);
    let merge = pool.nodes().unwrap().merge;
    assert_eq!(graph.links_into(merge).len(), 16);
    assert_eq!(graph.state(merge), Some(NodeState::Playing));
}

#[test]
fn setup_before_create_fails() {
    let mut conference = Conference::new(ConferenceConfig::default(), Arc::new(InMemoryGraph::new()));
    assert!(matches!(
        conference.add_track(MediaType::Audio),
        Err(ConferenceError::NotInitialized)
    ));
    assert!(matches!(
        conference.add_participant(),
        Err(ConferenceError::NotInitialized)
    ));
}

#[test]
fn second_stream_for_participant_is_rejected() {
    let (mut conference, _graph, _transport) = setup();

    let track = conference.add_track(MediaType::Video).unwrap().id();
    let participant = conference.add_participant().unwrap().id();
    conference
        .new_stream(track, participant, Direction::Both)
        .unwrap();

    let err = conference
        .new_stream(track, participant, Direction::Send)
        .unwrap_err();
    assert!(matches!(err, ConferenceError::DuplicateStream { .. }));
    assert_eq!(conference.track(track).unwrap().streams().count(), 1);
}

#[test]
fn second_producer_is_rejected() {
    let (mut conference, graph, _transport) = setup();

    let track = conference.add_track(MediaType::Video).unwrap().id();
    let producer = conference
        .attach_producer(track, "videotestsrc ! videoscale")
        .unwrap();
    conference.start().unwrap();
    assert_eq!(graph.state(producer), Some(NodeState::Playing));

    let err = conference.attach_producer(track, "videotestsrc").unwrap_err();
    assert!(matches!(err, ConferenceError::InvalidState(_)));
    assert_eq!(conference.track(track).unwrap().producer(), Some(producer));
}

#[test]
fn dispatcher_serializes_transport_events() {
    let (mut conference, _graph, _transport) = setup();

    let track = conference.add_track(MediaType::Video).unwrap().id();
    let participant = conference.add_participant().unwrap().id();
    let stream = conference
        .new_stream(track, participant, Direction::Recv)
        .unwrap();
    stream.set_transmitter(TransmitterKind::Multicast).unwrap();
    stream.set_remote_codecs(h263()).unwrap();
    stream.force_remote_candidates(multicast_candidates()).unwrap();
    let key = stream.key();

    let seen = Arc::new(Mutex::new(vec![]));
    let sink = Arc::clone(&seen);
    conference
        .stream_mut(key)
        .unwrap()
        .subscribe(move |media| sink.lock().push(media.ssrc));

    let (events, queue) = dispatcher::channel(4);
    let mut dispatcher = Dispatcher::new(conference, queue);

    let senders: Vec<_> = (0..3u32)
        .map(|n| {
            let events = events.clone();
            thread::spawn(move || {
                for ssrc in [n, n + 10, n] {
                    events
                        .send(Propagated::SourceDiscovered {
                            key,
                            ssrc,
                            payload_type: 96,
                        })
                        .unwrap();
                }
            })
        })
        .collect();

    let stopper = thread::spawn(move || {
        for sender in senders {
            sender.join().unwrap();
        }
        events.stop().unwrap();
    });

    dispatcher.run();
    stopper.join().unwrap();

    let mut ssrcs = seen.lock().clone();
    ssrcs.sort_unstable();
    assert_eq!(ssrcs, vec![0, 1, 2, 10, 11, 12]);
    assert_eq!(dispatcher.conference().sink_pool().constructions(), 1);
    assert_eq!(dispatcher.conference().sink_pool().linked_sources().len(), 6);
}

#[test]
fn removed_participant_releases_transport() {
    let (mut conference, _graph, transport) = setup();

    let track = conference.add_track(MediaType::Video).unwrap().id();
    let mut keys = vec![];
    for _ in 0..2 {
        let participant = conference.add_participant().unwrap().id();
        let stream = conference
            .new_stream(track, participant, Direction::Both)
            .unwrap();
        stream.set_transmitter(TransmitterKind::Multicast).unwrap();
        stream.force_remote_candidates(multicast_candidates()).unwrap();
        keys.push(stream.key());
    }

    conference.remove_participant(keys[0].participant).unwrap();
    assert_eq!(*transport.released.lock(), vec![keys[0]]);

    drop(conference);
    assert_eq!(*transport.released.lock(), keys);
}
