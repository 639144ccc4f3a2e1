use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use eos_payload::bus::{BusMessage, MessageBus, TcpBus, Topic, DEFAULT_BUS_ADDRESS};
use eos_payload::device::DeviceId;
use eos_payload::logging::init_console_logging;
use eos_payload::packet::{DataHeader, DataType, Packet, Priority};
use std::sync::Arc;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("eos-bus")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Payload Software Team")
        .about("Publish to and watch the payload message bus")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("bus")
                .short("b")
                .long("bus")
                .value_name("ADDRESS")
                .help("Bus broker address")
                .takes_value(true)
                .default_value(DEFAULT_BUS_ADDRESS)
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("publish")
                .about("Publish one packet")
                .arg(Arg::with_name("topic").help("Topic, e.g. ping/command").required(true))
                .arg(
                    Arg::with_name("sender")
                        .long("sender")
                        .value_name("DEVICE")
                        .takes_value(true)
                        .default_value("GROUND_STATION"),
                )
                .arg(
                    Arg::with_name("destination")
                        .long("destination")
                        .value_name("DEVICE")
                        .takes_value(true)
                        .default_value("BROADCAST"),
                )
                .arg(
                    Arg::with_name("type")
                        .long("type")
                        .value_name("CODE")
                        .help("Data type code")
                        .takes_value(true)
                        .default_value("0"),
                )
                .arg(
                    Arg::with_name("priority")
                        .long("priority")
                        .value_name("CODE")
                        .help("Priority code")
                        .takes_value(true)
                        .default_value("1"),
                )
                .arg(
                    Arg::with_name("hex")
                        .long("hex")
                        .help("Treat BODY as hex-encoded bytes"),
                )
                .arg(Arg::with_name("body").help("Packet body").default_value("")),
        )
        .subcommand(
            SubCommand::with_name("monitor")
                .about("Print every packet on the given topics (all topics by default)")
                .arg(Arg::with_name("topic").multiple(true)),
        )
        .get_matches();

    let _ = init_console_logging("warn");
    let address = matches.value_of("bus").unwrap_or(DEFAULT_BUS_ADDRESS);

    match matches.subcommand() {
        ("publish", Some(sub_matches)) => handle_publish(sub_matches, address).await,
        ("monitor", Some(sub_matches)) => handle_monitor(sub_matches, address).await,
        _ => Ok(()),
    }
}

async fn handle_publish(matches: &ArgMatches<'_>, address: &str) -> Result<(), Box<dyn std::error::Error>> {
    let topic: Topic = matches.value_of("topic").unwrap_or_default().parse()?;
    let sender: DeviceId = matches.value_of("sender").unwrap_or_default().parse()?;
    let destination: DeviceId = matches.value_of("destination").unwrap_or_default().parse()?;
    let data_type = DataType::from_code(matches.value_of("type").unwrap_or_default().parse()?)?;
    let priority = Priority::from_code(matches.value_of("priority").unwrap_or_default().parse()?)?;

    let raw_body = matches.value_of("body").unwrap_or_default();
    let body = if matches.is_present("hex") {
        parse_hex(raw_body)?
    } else {
        raw_body.as_bytes().to_vec()
    };

    let header = DataHeader::new(sender, data_type, priority).with_destination(destination);
    let packet = Packet::new(header, body)?;

    let bus = TcpBus::connect(address).await?;
    bus.send(topic, packet.encode()?)?;
    bus.close().await;

    println!("{} {} {}", "published".green(), topic.to_string().bright_cyan(), packet.body_display());
    Ok(())
}

async fn handle_monitor(matches: &ArgMatches<'_>, address: &str) -> Result<(), Box<dyn std::error::Error>> {
    let topics: Vec<Topic> = match matches.values_of("topic") {
        Some(values) => values.map(str::parse::<Topic>).collect::<Result<_, _>>()?,
        None => Topic::ALL.to_vec(),
    };

    let bus = TcpBus::connect(address).await?;
    let (tx, mut rx) = mpsc::unbounded_channel::<BusMessage>();
    for topic in &topics {
        let tx = tx.clone();
        bus.register_subscriber(
            *topic,
            Arc::new(move |message: BusMessage| {
                let _ = tx.send(message);
            }),
        )?;
    }
    println!("{} {}", "monitoring".dimmed(), address);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            message = rx.recv() => {
                let Some(message) = message else { break };
                print_message(&message);
            }
        }
    }

    bus.disconnect();
    Ok(())
}

fn print_message(message: &BusMessage) {
    let topic = message.topic.to_string();
    match Packet::decode(&message.payload) {
        Ok(packet) => {
            let header = &packet.data_header;
            let priority = match header.priority {
                Priority::Urgent => format!("{:?}", header.priority).bright_red(),
                Priority::Telemetry => format!("{:?}", header.priority).bright_green(),
                _ => format!("{:?}", header.priority).normal(),
            };
            println!(
                "{} {} {} -> {} {:?} {} {}",
                header.generate_time.format("%H:%M:%S%.3f").to_string().dimmed(),
                topic.bright_cyan(),
                header.sender,
                header.destination,
                header.data_type,
                priority,
                packet.body_display()
            );
        }
        Err(e) => println!("{} {} {}", topic.bright_cyan(), "undecodable:".red(), e),
    }
}

fn parse_hex(text: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let text = text.trim();
    if text.len() % 2 != 0 || !text.is_ascii() {
        return Err("hex body must be an even number of hex digits".into());
    }
    let mut bytes = Vec::with_capacity(text.len() / 2);
    for i in (0..text.len()).step_by(2) {
        bytes.push(u8::from_str_radix(&text[i..i + 2], 16)?);
    }
    Ok(bytes)
}
