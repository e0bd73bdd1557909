use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use parking_lot::Mutex;
use rtpvideo::{
    BufferPool, DatagramSink, EncodedAccessUnit, InMemoryControlChannel, NegotiationManager,
    NegotiationState, NoopCipher, PayloadCipher, ReceiverConfig, Result, RtpVideoReceiver,
    RtpVideoSender, SenderConfig, UdpTransport, VideoEncoder, VideoSessionConfig, XorTestCipher,
};

#[derive(Parser)]
#[command(
    name = "rtp-video-loopback",
    about = "Send synthetic H.264 through an impaired loopback and report delivery"
)]
struct Args {
    /// Number of access units to send
    #[arg(long, short, default_value_t = 300)]
    frames: u32,

    /// Frame rate used for RTP timestamps and pacing
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Annex-B size of each synthetic access unit in bytes
    #[arg(long, default_value_t = 6000)]
    frame_size: usize,

    /// Send an IDR every N frames
    #[arg(long, default_value_t = 60)]
    key_interval: u32,

    /// Probability of dropping a packet (0.0 - 1.0)
    #[arg(long, default_value_t = 0.01)]
    loss: f64,

    /// Probability of swapping a packet with the next one (0.0 - 1.0)
    #[arg(long, default_value_t = 0.02)]
    reorder: f64,

    #[arg(long, default_value_t = 1200)]
    mtu: usize,

    /// XOR payloads with this key
    #[arg(long)]
    xor_key: Option<u8>,

    /// Carry packets over a UDP socket pair on 127.0.0.1
    #[arg(long)]
    udp: bool,

    /// Sleep between frames instead of sending as fast as possible
    #[arg(long)]
    realtime: bool,
}

/// Stand-in encoder: PLIs force the next frame to be an IDR.
#[derive(Default)]
struct SyntheticEncoder {
    key_requested: AtomicBool,
    key_requests: AtomicU64,
}

impl VideoEncoder for SyntheticEncoder {
    fn request_key_frame(&self) {
        self.key_requests.fetch_add(1, Ordering::Relaxed);
        self.key_requested.store(true, Ordering::Relaxed);
    }
}

/// Drops and swaps packets on their way to `next`.
struct ImpairedLink {
    loss: f64,
    reorder: f64,
    held: Mutex<Option<Vec<u8>>>,
    next: Arc<dyn DatagramSink>,
    dropped: AtomicU64,
    swapped: AtomicU64,
}

impl DatagramSink for ImpairedLink {
    fn send(&self, datagram: &[u8]) -> Result<()> {
        if rand::random::<f64>() < self.loss {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        let mut held = self.held.lock();
        if held.is_none() && rand::random::<f64>() < self.reorder {
            *held = Some(datagram.to_vec());
            self.swapped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        self.next.send(datagram)?;
        if let Some(late) = held.take() {
            self.next.send(&late)?;
        }
        Ok(())
    }
}

/// Where the receiver picks up what survived the link.
enum Inbound {
    Memory(Arc<Mutex<Vec<Vec<u8>>>>),
    Udp(UdpTransport),
}

impl Inbound {
    fn drain(&self) -> Vec<Vec<u8>> {
        match self {
            Self::Memory(queue) => std::mem::take(&mut *queue.lock()),
            Self::Udp(socket) => {
                let mut out = Vec::new();
                let mut buf = [0u8; 2048];
                // read timeout ends the burst
                while let Ok((n, _)) = socket.recv(&mut buf) {
                    out.push(buf[..n].to_vec());
                }
                out
            }
        }
    }
}

/// Annex-B access unit of roughly `size` bytes; the slice filler never
/// contains a zero byte.
fn synthetic_frame(index: u32, size: usize, key_frame: bool) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    if key_frame {
        data.extend_from_slice(&[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1f, 0xe9, 0x02, 0xc1]);
        data.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xce, 0x38, 0x80]);
    }
    data.extend_from_slice(&[0, 0, 0, 1, if key_frame { 0x65 } else { 0x41 }]);
    let fill = size.saturating_sub(data.len()).max(1);
    data.extend((0..fill).map(|i| ((index as usize + i) % 255) as u8 + 1));
    data
}

fn negotiate(
    config: &VideoSessionConfig,
    encoder: Arc<SyntheticEncoder>,
) -> Result<(Arc<NegotiationManager>, Arc<NegotiationManager>)> {
    let (a, b) = InMemoryControlChannel::pair()?;
    let local = NegotiationManager::new(Arc::new(a));
    let remote = NegotiationManager::new(Arc::new(b));
    local.attach_encoder(encoder);

    let weak: Weak<NegotiationManager> = Arc::downgrade(&remote);
    remote.on_offer_received(move |offer| {
        if let Some(remote) = weak.upgrade()
            && let Err(e) = remote.accept_offer(offer)
        {
            tracing::warn!(error = %e, "failed to answer offer");
        }
    });

    local.create_offer(config)?;
    let deadline = Instant::now() + Duration::from_secs(1);
    while local.state() != NegotiationState::Established && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    tracing::info!(state = %local.state(), "negotiation finished");
    Ok((local, remote))
}

fn run(args: &Args) -> Result<()> {
    let cipher: Arc<dyn PayloadCipher> = match args.xor_key {
        Some(key) => Arc::new(XorTestCipher::new(key)),
        None => Arc::new(NoopCipher),
    };

    let (next, inbound): (Arc<dyn DatagramSink>, Inbound) = if args.udp {
        let rx_socket = UdpTransport::bind("127.0.0.1:0")?;
        rx_socket.set_read_timeout(Some(Duration::from_millis(5)))?;
        let tx_socket = UdpTransport::bind("127.0.0.1:0")?;
        tx_socket.connect(rx_socket.local_addr()?)?;
        tracing::info!(receiver = %rx_socket.local_addr()?, "using UDP loopback");
        let sink: Arc<dyn DatagramSink> = Arc::new(tx_socket);
        (sink, Inbound::Udp(rx_socket))
    } else {
        let queue = Arc::new(Mutex::new(Vec::new()));
        let sink_queue = queue.clone();
        let sink: Arc<dyn DatagramSink> = Arc::new(move |d: &[u8]| -> Result<()> {
            sink_queue.lock().push(d.to_vec());
            Ok(())
        });
        (sink, Inbound::Memory(queue))
    };
    let link = Arc::new(ImpairedLink {
        loss: args.loss,
        reorder: args.reorder,
        held: Mutex::new(None),
        next,
        dropped: AtomicU64::new(0),
        swapped: AtomicU64::new(0),
    });

    let sender_config = SenderConfig {
        mtu: args.mtu,
        ..Default::default()
    };
    let sender = RtpVideoSender::new(sender_config, cipher.clone(), link.clone())?;
    let receiver = RtpVideoReceiver::new(ReceiverConfig::default(), cipher)?;

    let session = VideoSessionConfig {
        fps: args.fps,
        mtu: args.mtu,
        ..Default::default()
    };
    let encoder = Arc::new(SyntheticEncoder::default());
    let (_local, remote) = negotiate(&session, encoder.clone())?;

    let ts_step = session.timestamp_increment();
    let frame_interval = Duration::from_secs(1) / args.fps.max(1);
    let pool = BufferPool::new(4);
    let mut sent: HashMap<u32, Vec<u8>> = HashMap::new();
    let mut delivered = 0u64;
    let mut corrupt = 0u64;
    let mut dropped_seen = 0u64;

    for index in 0..args.frames {
        let forced = encoder.key_requested.swap(false, Ordering::Relaxed);
        let key_frame = forced || index % args.key_interval.max(1) == 0;
        let data = synthetic_frame(index, args.frame_size, key_frame);
        let ts = index.wrapping_mul(ts_step);
        let au = EncodedAccessUnit::from_annex_b(&pool, &data, key_frame, ts, i64::from(index))?;
        sender.send(&au)?;
        sent.insert(ts, data);

        for datagram in inbound.drain() {
            for unit in receiver.process_datagram(&datagram)? {
                delivered += 1;
                if sent.get(&unit.rtp_timestamp()).map(Vec::as_slice) != Some(unit.annex_b()) {
                    corrupt += 1;
                }
            }
        }

        let dropped = receiver.stats().frames_dropped;
        if dropped > dropped_seen {
            dropped_seen = dropped;
            remote.request_key_frame()?;
        }

        if index % args.fps.max(1) == args.fps.max(1) - 1 {
            let sr = sender.build_sender_report(ts);
            receiver.process_rtcp(&sr);
            if let Some(rr) = receiver.build_receiver_report(0x4C4F_4F50) {
                sender.process_rtcp(&rr);
            }
            tracing::info!(frame = index, stats = %sender.stats(), "sender");
        }

        if args.realtime {
            thread::sleep(frame_interval);
        }
    }

    let tx = sender.stats();
    let rx = receiver.stats();
    println!("frames sent       {}", args.frames);
    println!("frames delivered  {delivered}");
    println!("frames corrupt    {corrupt}");
    println!(
        "link              dropped={} swapped={}",
        link.dropped.load(Ordering::Relaxed),
        link.swapped.load(Ordering::Relaxed)
    );
    println!(
        "key frame requests {}",
        encoder.key_requests.load(Ordering::Relaxed)
    );
    println!("sender            {tx}");
    println!("receiver          {rx}");
    Ok(())
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    if let Err(e) = run(&args) {
        eprintln!("Loopback failed: {}", e);
        std::process::exit(1);
    }
}
