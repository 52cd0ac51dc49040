use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tn3270r::lib3270::codes::{AID_ENTER, CMD_ERASE_WRITE, ORDER_SBA, ORDER_SF};
use tn3270r::lib3270::display::{addressing, ScreenBuffer, ScreenSize};
use tn3270r::lib3270::protocol::{read_modified, DataStreamProcessor, PdsResult};
use tn3270r::telnet_negotiation::{
    ConnectionState, NegotiatorConfig, RecordHandler, TelnetFramer, DO, IAC, OPT_BINARY, OPT_EOR, OPT_TTYPE,
    WILL,
};

/// Counts records without looking at them
struct Sink {
    records: usize,
}

impl RecordHandler for Sink {
    fn process_ds(&mut self, _record: &[u8]) -> PdsResult {
        self.records += 1;
        PdsResult::OkayNoOutput
    }

    fn write_sscp_lu(&mut self, _record: &[u8]) {}

    fn process_nvt(&mut self, _data: &[u8]) {}

    fn mode_changed(&mut self, _state: ConnectionState, _bound: bool) {}
}

/// Erase/Write filling every row with a label and an input field
fn full_screen() -> Vec<u8> {
    let mut data = vec![CMD_ERASE_WRITE, 0x02];
    for row in 0..24u16 {
        let (b1, b2) = addressing::encode_12bit_address(row * 80);
        data.extend_from_slice(&[ORDER_SBA, b1, b2, ORDER_SF, 0x20]);
        data.extend(std::iter::repeat(0xC1).take(20));
        data.extend_from_slice(&[ORDER_SF, 0x00]);
        data.extend(std::iter::repeat(0x81).take(57));
    }
    data
}

fn tn3270_framer() -> TelnetFramer {
    let mut framer = TelnetFramer::new(NegotiatorConfig {
        non_tn3270e: true,
        ..NegotiatorConfig::default()
    });
    framer.set_state(ConnectionState::ConnectedInitial);
    let mut sink = Sink { records: 0 };
    framer
        .process_incoming(
            &[IAC, DO, OPT_TTYPE, IAC, DO, OPT_BINARY, IAC, WILL, OPT_BINARY, IAC, DO, OPT_EOR, IAC, WILL, OPT_EOR],
            &mut sink,
        )
        .unwrap();
    framer.take_output();
    framer
}

fn bench_process_ds(c: &mut Criterion) {
    let data = full_screen();
    let mut group = c.benchmark_group("process_ds");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("erase_write_full_screen", |b| {
        let mut screen = ScreenBuffer::new(ScreenSize::Model2);
        let mut processor = DataStreamProcessor::new();
        b.iter(|| {
            black_box(processor.process_ds(&mut screen, black_box(&data)));
            processor.take_writes();
        })
    });
    group.finish();
}

fn bench_framer(c: &mut Criterion) {
    let mut record = full_screen();
    record.push(IAC);
    record.push(IAC);
    let mut tx = tn3270_framer();
    tx.send_record(&record);
    let wire = tx.take_output();

    let mut group = c.benchmark_group("framer");
    group.throughput(Throughput::Bytes(wire.len() as u64));
    group.bench_function("deframe_record", |b| {
        let mut framer = tn3270_framer();
        let mut sink = Sink { records: 0 };
        b.iter(|| {
            framer.process_incoming(black_box(&wire), &mut sink).unwrap();
        })
    });
    group.bench_function("frame_record", |b| {
        let mut framer = tn3270_framer();
        b.iter(|| {
            framer.send_record(black_box(&record));
            black_box(framer.take_output());
        })
    });
    group.finish();
}

fn bench_read_modified(c: &mut Criterion) {
    let mut screen = ScreenBuffer::new(ScreenSize::Model2);
    let mut processor = DataStreamProcessor::new();
    processor.process_ds(&mut screen, &full_screen());
    c.bench_function("read_modified_all", |b| {
        b.iter(|| black_box(read_modified(black_box(&screen), AID_ENTER, true)))
    });
}

criterion_group!(benches, bench_process_ds, bench_framer, bench_read_modified);
criterion_main!(benches);
