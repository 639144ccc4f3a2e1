use eos_payload::bus::{BusMessage, LocalBus, MessageBus, Topic};
use eos_payload::config::{pretty_id, DeviceConfig};
use eos_payload::device::DeviceId;
use eos_payload::driver::{DataLog, DriverRuntime, TaskContext};
use eos_payload::drivers::downlink::*;
use eos_payload::packet::{DataHeader, DataType, Packet, Priority};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const FILE_ID: u32 = 7;

fn sample_file(name: &str, len: usize) -> (PathBuf, Vec<u8>) {
    let dir = std::env::temp_dir().join(format!("eos-downlink-{}-{}", std::process::id(), name));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("image.bin");
    let contents: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();
    std::fs::write(&path, &contents).unwrap();
    (path, contents)
}

/// Everything the downlink driver puts on `radio/transmit`.
struct Ground {
    bus: Arc<LocalBus>,
    radio: mpsc::UnboundedReceiver<Packet>,
}

impl Ground {
    fn new() -> Self {
        let bus = LocalBus::new();
        let (tx, radio) = mpsc::unbounded_channel();
        bus.register_subscriber(
            Topic::RadioTransmit,
            Arc::new(move |message: BusMessage| {
                let _ = tx.send(Packet::decode(&message.payload).unwrap());
            }),
        )
        .unwrap();
        Self { bus, radio }
    }

    fn context(&self) -> TaskContext {
        TaskContext::new(
            "downlink-007",
            DeviceId::Downlink,
            CancellationToken::new(),
            Some(self.bus.clone()),
            Arc::new(DataLog::disabled()),
        )
    }

    async fn next(&mut self) -> Packet {
        tokio::time::timeout(Duration::from_secs(5), self.radio.recv())
            .await
            .expect("nothing sent to the radio")
            .unwrap()
    }

    async fn next_command(&mut self) -> DownlinkCommand {
        let packet = self.next().await;
        assert_eq!(packet.data_header.data_type, DataType::DownlinkCommand);
        assert_eq!(packet.data_header.destination, DeviceId::GroundStation);
        DownlinkCommand::decode(&packet.body).unwrap()
    }

    async fn next_chunk(&mut self) -> DownlinkChunk {
        let packet = self.next().await;
        assert_eq!(packet.data_header.data_type, DataType::DownlinkChunk);
        assert_eq!(packet.data_header.priority, Priority::Data);
        DownlinkChunk::decode(&packet.body).unwrap()
    }

    async fn assert_quiet(&mut self) {
        let waited = tokio::time::timeout(Duration::from_millis(200), self.radio.recv()).await;
        assert!(waited.is_err(), "unexpected radio traffic: {waited:?}");
    }
}

fn command(command_type: CommandType, num_chunks: u32, missing: &[u32]) -> DownlinkCommand {
    let mut command = DownlinkCommand::new(FILE_ID, num_chunks, command_type);
    command.missing_chunks = missing.iter().copied().collect::<BTreeSet<_>>();
    command
}

#[tokio::test]
async fn test_file_is_reconstructed_after_retransmit() {
    let (path, contents) = sample_file("reconstruct", 1000);
    let mut ground = Ground::new();
    let ctx = ground.context();
    let mut controller = DownlinkController::with_chunk_size(BTreeMap::from([(FILE_ID, path)]), CHUNK_SIZE).unwrap();

    controller
        .handle_command(&ctx, DeviceId::GroundStation, &command(CommandType::StartRequest, 0, &[]))
        .unwrap();
    let ack = ground.next_command().await;
    assert_eq!(ack.command_type, CommandType::StartAck);
    assert_eq!(ack.num_chunks, 5);

    controller
        .handle_command(&ctx, DeviceId::GroundStation, &command(CommandType::StartAck, 5, &[]))
        .unwrap();
    let mut received: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
    for expected in 0..5 {
        let chunk = ground.next_chunk().await;
        assert_eq!(chunk.chunk_num, expected);
        // Chunk 2 is lost in transit.
        if chunk.chunk_num != 2 {
            received.insert(chunk.chunk_num, chunk.body);
        }
    }
    assert_eq!(received[&0].len(), CHUNK_SIZE);
    assert_eq!(received[&4].len(), 1000 - 4 * CHUNK_SIZE);

    controller
        .handle_command(
            &ctx,
            DeviceId::GroundStation,
            &command(CommandType::RetransmitMissingChunks, 5, &[2]),
        )
        .unwrap();
    assert_eq!(
        controller.session().unwrap().unacknowledged(),
        BTreeSet::from([2])
    );
    let resent = ground.next_chunk().await;
    assert_eq!(resent.chunk_num, 2);
    received.insert(resent.chunk_num, resent.body);
    ground.assert_quiet().await;

    controller
        .handle_command(
            &ctx,
            DeviceId::GroundStation,
            &command(CommandType::RetransmitMissingChunks, 5, &[]),
        )
        .unwrap();
    let stop = ground.next_command().await;
    assert_eq!(stop.command_type, CommandType::StopTransmission);
    assert!(controller.session().is_none());

    let rebuilt: Vec<u8> = received.into_values().flatten().collect();
    assert_eq!(rebuilt, contents);
}

#[test]
fn test_chunk_size_must_fit_in_a_packet() {
    assert!(matches!(
        DownlinkController::with_chunk_size(BTreeMap::new(), CHUNK_SIZE + 1),
        Err(DownlinkError::InvalidChunkSize(_))
    ));
    assert!(matches!(
        DownlinkController::with_chunk_size(BTreeMap::new(), 0),
        Err(DownlinkError::InvalidChunkSize(0))
    ));
    assert!(DownlinkController::with_chunk_size(BTreeMap::new(), 1).is_ok());
}

#[tokio::test]
async fn test_unsent_chunk_stays_pending() {
    let (path, _) = sample_file("unsent", 500);
    let ctx = TaskContext::new(
        "downlink-007",
        DeviceId::Downlink,
        CancellationToken::new(),
        None,
        Arc::new(DataLog::disabled()),
    );
    let mut controller = DownlinkController::with_chunk_size(BTreeMap::from([(FILE_ID, path)]), 100).unwrap();

    // No bus: the ack cannot be sent but the session is open.
    assert!(controller
        .handle_command(&ctx, DeviceId::GroundStation, &command(CommandType::StartRequest, 0, &[]))
        .is_err());
    assert!(controller
        .handle_command(&ctx, DeviceId::GroundStation, &command(CommandType::StartAck, 5, &[]))
        .is_err());
    assert_eq!(controller.session().unwrap().pending(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_commands_for_another_file_are_ignored() {
    let (path, _) = sample_file("mismatch", 500);
    let mut ground = Ground::new();
    let ctx = ground.context();
    let mut controller = DownlinkController::with_chunk_size(BTreeMap::from([(FILE_ID, path)]), 100).unwrap();

    controller
        .handle_command(&ctx, DeviceId::GroundStation, &command(CommandType::StartRequest, 0, &[]))
        .unwrap();
    assert_eq!(ground.next_command().await.num_chunks, 5);

    controller
        .handle_command(&ctx, DeviceId::GroundStation, &command(CommandType::StartAck, 6, &[]))
        .unwrap();
    let mut other_file = command(CommandType::StartAck, 5, &[]);
    other_file.file_id = FILE_ID + 1;
    controller
        .handle_command(&ctx, DeviceId::GroundStation, &other_file)
        .unwrap();
    ground.assert_quiet().await;
    assert_eq!(controller.session().unwrap().pending(), vec![0, 1, 2, 3, 4]);

    controller
        .handle_command(&ctx, DeviceId::GroundStation, &command(CommandType::StopTransmission, 5, &[]))
        .unwrap();
    assert!(controller.session().is_none());
}

#[tokio::test]
async fn test_unknown_file_is_refused() {
    let mut ground = Ground::new();
    let ctx = ground.context();
    let mut controller = DownlinkController::new(BTreeMap::new());

    controller
        .handle_command(&ctx, DeviceId::GroundStation, &command(CommandType::StartRequest, 0, &[]))
        .unwrap();
    let stop = ground.next_command().await;
    assert_eq!(stop.command_type, CommandType::StopTransmission);
    assert_eq!(stop.file_id, FILE_ID);
    assert_eq!(stop.num_chunks, 0);
    assert!(controller.session().is_none());
}

#[tokio::test]
async fn test_new_start_request_replaces_open_session() {
    let (first, _) = sample_file("restart-a", 10);
    let (second, _) = sample_file("restart-b", 700);
    let mut ground = Ground::new();
    let ctx = ground.context();
    let files = BTreeMap::from([(1, first), (2, second)]);
    let mut controller = DownlinkController::with_chunk_size(files, 100).unwrap();

    controller
        .handle_command(&ctx, DeviceId::GroundStation, &DownlinkCommand::new(1, 0, CommandType::StartRequest))
        .unwrap();
    assert_eq!(ground.next_command().await.num_chunks, 1);

    controller
        .handle_command(&ctx, DeviceId::GroundStation, &DownlinkCommand::new(2, 0, CommandType::StartRequest))
        .unwrap();
    let ack = ground.next_command().await;
    assert_eq!((ack.file_id, ack.num_chunks), (2, 7));
    assert_eq!(controller.session().unwrap().file_id(), 2);
}

#[tokio::test]
async fn test_non_command_packets_are_ignored() {
    let mut ground = Ground::new();
    let ctx = ground.context();
    let mut controller = DownlinkController::new(BTreeMap::new());

    let header = DataHeader::new(DeviceId::GroundStation, DataType::Telemetry, Priority::Urgent);
    let packet = Packet::new(header, vec![0; 9]).unwrap();
    controller.handle_packet(&ctx, &packet).unwrap();
    ground.assert_quiet().await;
}

#[tokio::test]
async fn test_downlink_driver_answers_over_the_bus() {
    let (path, _) = sample_file("driver", 1000);
    let mut ground = Ground::new();
    let mut files = serde_json::Map::new();
    files.insert(FILE_ID.to_string(), Value::String(path.to_string_lossy().into_owned()));
    let mut settings = serde_json::Map::new();
    settings.insert("files".into(), Value::Object(files));
    let config = DeviceConfig {
        device_id: DeviceId::Downlink,
        name: "downlink".into(),
        driver_class: "DownlinkDriver".into(),
        pretty_id: pretty_id("downlink", DeviceId::Downlink).unwrap(),
        settings,
    };
    assert_eq!(parse_file_table(&config).unwrap()[&FILE_ID], path);

    let driver = DownlinkDriver::from_config(&config).unwrap();
    let mut runtime = DriverRuntime::with_parts(
        config,
        driver,
        Some(ground.bus.clone()),
        Arc::new(DataLog::disabled()),
    );
    runtime.start();

    let header = DataHeader::new(DeviceId::GroundStation, DataType::DownlinkCommand, Priority::Urgent)
        .with_destination(DeviceId::Downlink);
    let request = Packet::new(header, command(CommandType::StartRequest, 0, &[]).encode().unwrap()).unwrap();
    ground
        .bus
        .send(Topic::DownlinkCommand, request.encode().unwrap())
        .unwrap();

    let ack = ground.next_command().await;
    assert_eq!(ack.command_type, CommandType::StartAck);
    assert_eq!(ack.num_chunks, 1000u32.div_ceil(CHUNK_SIZE as u32));

    runtime.cleanup();
}
