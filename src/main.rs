use chrono::NaiveDateTime;
use dissect::{Direction, Engine, EngineConfig, FiveTuple, Session};
use etherparse::{InternetSlice, SlicedPacket, TransportSlice};
use failure::{bail, format_err, Error, ResultExt};
use flowprobe::assemble::{FlowId, HalfStream};
use log::{debug, warn};
use pcap_parser::{data::PacketData, PcapCapture, PcapError};
use serde_json::json;
use std::{collections::BTreeMap, fs, net::Ipv4Addr, path::PathBuf};
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
struct CliArgs {
    /// pcap file to index
    #[structopt(parse(from_os_str))]
    pcap: PathBuf,

    /// Node name seeded as a `node:` tag on every session
    #[structopt(long = "node", default_value = "flowprobe")]
    node: String,

    /// Optional node class, seeded as a second `node:` tag
    #[structopt(long = "class")]
    class: Option<String>,

    /// Extra tags seeded on every session
    #[structopt(long = "tag")]
    tags: Vec<String>,

    /// UDP port treated as DNS
    #[structopt(long = "dns-port", default_value = "53")]
    dns_port: u16,

    /// Pretty-print the session documents
    #[structopt(short = "v", long = "verbose")]
    verbose: bool,
}

/// Per-flow accumulation the agent keeps next to the engine session.
struct Flow {
    session: Session,
    halves: [HalfStream; 2],
    initiator: (Ipv4Addr, u16),
    packets: u64,
    first: NaiveDateTime,
    last: NaiveDateTime,
}

impl Flow {
    fn direction(&self, source: (Ipv4Addr, u16)) -> Direction {
        if source == self.initiator {
            Direction::Client
        } else {
            Direction::Server
        }
    }
}

fn main() {
    use std::io::{self, Write};

    if let Err(err) = run() {
        let stderr = io::stderr();
        let mut out = stderr.lock();
        // cannot handle a write error here, we are already in the outermost layer
        let _ = writeln!(out, "An error occured:");
        for fail in err.iter_chain() {
            let _ = writeln!(out, "  {}", fail);
        }
        std::process::exit(1);
    }
}

fn run() -> Result<(), Error> {
    env_logger::init();
    let cli_args = CliArgs::from_args();

    let engine = Engine::new(EngineConfig {
        node_name: cli_args.node.clone(),
        node_class: cli_args.class.clone(),
        extra_tags: cli_args.tags.clone(),
        ..EngineConfig::default()
    });

    let flows = process_pcap(&engine, &cli_args)
        .with_context(|_| format!("Processing pcap '{}'", cli_args.pcap.display()))?;

    use std::io::Write;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for (_, mut flow) in flows {
        engine.on_close(&mut flow.session);

        let mut doc = engine.document(&flow.session);
        doc["firstPacket"] = json!(flow.first.timestamp());
        doc["lastPacket"] = json!(flow.last.timestamp());
        doc["packets"] = json!(flow.packets);

        if cli_args.verbose {
            writeln!(out, "{}", serde_json::to_string_pretty(&doc)?)?;
        } else {
            writeln!(out, "{}", serde_json::to_string(&doc)?)?;
        }
    }

    Ok(())
}

fn process_pcap(engine: &Engine, cli_args: &CliArgs) -> Result<BTreeMap<FlowId, Flow>, Error> {
    let file_content = fs::read(&cli_args.pcap)
        .with_context(|_| format!("Opening input file '{}' failed", cli_args.pcap.display()))?;
    let capture = PcapCapture::from_file(&file_content).map_err(|err| match err {
        PcapError::Eof => format_err!("Failed reading pcap: EOF"),
        PcapError::ReadError => format_err!("Failed reading pcap: Read error"),
        PcapError::Incomplete => format_err!("Failed reading pcap: Incomplete"),
        PcapError::HeaderNotRecognized => format_err!("Failed reading pcap: Header not recognized"),
        PcapError::NomError(nom_error) => format_err!(
            "Failed reading pcap: Nom Error: {}",
            nom_error.description()
        ),
    })?;
    let datalink_type = capture.header.network;

    let mut flows: BTreeMap<FlowId, Flow> = BTreeMap::new();
    // ID of the packet within the pcap, for log messages; starts at 1 like
    // wireshark's numbering
    let mut packet_id = 0u32;

    for pkt in capture.blocks {
        packet_id += 1;
        if pkt.caplen != pkt.origlen {
            bail!("Cannot process packets, as they are truncated");
        }

        // Try extracting an IPv4 packet from the raw bytes we have
        let parsed_packet;
        match pcap_parser::data::get_packetdata(pkt.data, datalink_type, pkt.caplen as usize) {
            None => bail!("Could not parse the packet data of packet_id {}", packet_id),
            Some(PacketData::Unsupported(_)) | Some(PacketData::L4(_, _)) => {
                bail!("Unsupported linktype {}", datalink_type)
            }
            Some(PacketData::L2(data)) => {
                // Normal Ethernet captures
                parsed_packet =
                    SlicedPacket::from_ethernet(data).map_err(|err| format_err!("{:?}", err))?;
            }
            Some(PacketData::L3(_, data)) => {
                // Linux cooked capture, used when capturing the `any` device
                parsed_packet =
                    SlicedPacket::from_ip(data).map_err(|err| format_err!("{:?}", err))?;
            }
        };

        let ipv4 = match parsed_packet.ip {
            Some(InternetSlice::Ipv4(inner)) => inner,
            _ => {
                debug!("({:>2}) Skipping non-IPv4 packet", packet_id);
                continue;
            }
        };

        if ipv4.more_fragments() {
            bail!("Fragmented packets are not supported");
        }

        let time =
            NaiveDateTime::from_timestamp(i64::from(pkt.ts_sec), (pkt.ts_usec * 1000) as u32);
        let source = (ipv4.source_addr(), 0u16);
        let destination = (ipv4.destination_addr(), 0u16);

        match parsed_packet.transport {
            Some(TransportSlice::Tcp(tcp)) => {
                if parsed_packet.payload.is_empty() {
                    // Empty acknowledgement
                    continue;
                }

                let source = (source.0, tcp.source_port());
                let destination = (destination.0, tcp.destination_port());
                let flowid = FlowId::from_pairs(6, source, destination);
                let flow = flows.entry(flowid).or_insert_with(|| Flow {
                    session: engine.new_session(FiveTuple::tcp(
                        source.0,
                        source.1,
                        destination.0,
                        destination.1,
                    )),
                    halves: [HalfStream::new(), HalfStream::new()],
                    initiator: source,
                    packets: 0,
                    first: time,
                    last: time,
                });
                flow.packets += 1;
                flow.last = time;

                let dir = flow.direction(source);
                debug!("({:>2}) Processing TCP segment", packet_id);
                for (offset, chunk) in
                    flow.halves[dir.index()].add_segment(tcp.sequence_number(), parsed_packet.payload)
                {
                    engine.on_tcp_bytes(&mut flow.session, dir, &chunk, offset);
                }
            }
            Some(TransportSlice::Udp(udp)) => {
                if udp.source_port() != cli_args.dns_port
                    && udp.destination_port() != cli_args.dns_port
                {
                    continue;
                }

                let source = (source.0, udp.source_port());
                let destination = (destination.0, udp.destination_port());
                let flowid = FlowId::from_pairs(17, source, destination);
                let flow = flows.entry(flowid).or_insert_with(|| Flow {
                    session: engine.new_session(FiveTuple::udp(
                        source.0,
                        source.1,
                        destination.0,
                        destination.1,
                    )),
                    halves: [HalfStream::new(), HalfStream::new()],
                    initiator: source,
                    packets: 0,
                    first: time,
                    last: time,
                });
                flow.packets += 1;
                flow.last = time;

                debug!("({:>2}) Processing DNS datagram", packet_id);
                engine.on_datagram(&mut flow.session, parsed_packet.payload);
            }
            _ => {
                warn!("({:>2}) Skipping non-TCP/UDP packet", packet_id);
            }
        }
    }

    Ok(flows)
}
