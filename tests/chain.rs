//! End-to-end scenarios through real filter stacks.

use nbdstack::backend::ChainBuilder;
use nbdstack::filters::{EvilFilter, PartitionFilter, RetryFilter};
use nbdstack::filters::evil::EvilMode;
use nbdstack::plugins::{FillPlugin, MemPlugin};
use nbdstack::{CmdFlags, ExtentFlags, Extents, ThreadModel};

const SS: usize = 512;
const MIB: u64 = 1 << 20;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn le32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn le64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// A disk with a GPT containing one partition spanning `first..=last`.
fn gpt_disk(total: usize, first: u64, last: u64) -> Vec<u8> {
    let mut disk = vec![0u8; total];
    let h = SS;
    disk[h..h + 8].copy_from_slice(b"EFI PART");
    le64(&mut disk, h + 72, 2);
    le32(&mut disk, h + 80, 128);
    le32(&mut disk, h + 84, 128);
    let e = 2 * SS;
    disk[e..e + 16].copy_from_slice(&[0xaa; 16]);
    le64(&mut disk, e + 32, first);
    le64(&mut disk, e + 40, last);
    disk
}

#[test]
fn fill_source_serves_its_byte_and_one_extent() {
    init_logging();
    let chain = ChainBuilder::new(Box::new(FillPlugin::new(MIB, 0xff)))
        .unwrap()
        .ready()
        .unwrap();
    let conn = chain.connect(true, "").unwrap();

    let mut buf = [0u8; 512];
    conn.pread(&mut buf, 0, CmdFlags::empty()).unwrap();
    assert!(buf.iter().all(|&b| b == 0xff));

    let mut extents = Extents::new(0, MIB);
    conn.extents(MIB as u32, 0, CmdFlags::empty(), &mut extents)
        .unwrap();
    assert_eq!(extents.count(), 1);
    assert_eq!(extents.get(0).length, MIB);
    assert_eq!(extents.get(0).flags, ExtentFlags::allocated());
    chain.disconnect(conn).unwrap();
}

#[test]
fn partition_window_reads_match_rebased_underlying_reads() {
    init_logging();
    // Partition spans LBAs 2048..10239 with sector size 512.
    let mut disk = gpt_disk(6 << 20, 2048, 10239);
    for (i, b) in disk.iter_mut().enumerate().skip(2048 * SS).take(4096) {
        *b = (i % 251) as u8;
    }
    let expected: Vec<u8> = disk[1_048_576..1_048_576 + 512].to_vec();

    let chain = ChainBuilder::new(Box::new(MemPlugin::with_data(disk)))
        .unwrap()
        .filter(Box::new(PartitionFilter::for_partition(1)))
        .unwrap()
        .ready()
        .unwrap();
    let conn = chain.connect(true, "").unwrap();

    assert_eq!(conn.get_size().unwrap(), (10239 - 2048 + 1) * 512);

    // Offset 0 through the filter is byte 1 MiB on the underlying disk.
    let mut buf = [0u8; 512];
    conn.pread(&mut buf, 0, CmdFlags::empty()).unwrap();
    assert_eq!(&buf[..], &expected[..]);
    chain.disconnect(conn).unwrap();
}

#[test]
fn stacked_chain_negotiates_the_strictest_thread_model() {
    init_logging();
    // fill and partition are Parallel; retry forces SerializeRequests.
    let disk = gpt_disk(6 << 20, 2048, 10239);
    let chain = ChainBuilder::new(Box::new(MemPlugin::with_data(disk)))
        .unwrap()
        .filter(Box::new(PartitionFilter::for_partition(1)))
        .unwrap()
        .filter(Box::new(RetryFilter::new()))
        .unwrap()
        .ready()
        .unwrap();
    assert_eq!(chain.thread_model(), ThreadModel::SerializeRequests);

    // The stacked chain still serves data.
    let conn = chain.connect(true, "").unwrap();
    let mut buf = [0u8; 512];
    conn.pread(&mut buf, 0, CmdFlags::empty()).unwrap();
    chain.disconnect(conn).unwrap();
}

#[test]
fn evil_with_zero_probability_is_transparent_through_a_stack() {
    init_logging();
    let mut disk = gpt_disk(6 << 20, 2048, 10239);
    disk[2048 * SS] = 0x77;
    let chain = ChainBuilder::new(Box::new(MemPlugin::with_data(disk)))
        .unwrap()
        .filter(Box::new(PartitionFilter::for_partition(1)))
        .unwrap()
        .filter(Box::new(
            EvilFilter::new(EvilMode::StuckBits)
                .with_seed(1)
                .with_probability(0.0),
        ))
        .unwrap()
        .ready()
        .unwrap();
    let conn = chain.connect(true, "").unwrap();
    let mut buf = [0u8; 1];
    conn.pread(&mut buf, 0, CmdFlags::empty()).unwrap();
    assert_eq!(buf[0], 0x77);
    chain.disconnect(conn).unwrap();
}

#[test]
fn config_keys_route_to_the_right_layer() {
    init_logging();
    let mut builder = ChainBuilder::new(Box::new(FillPlugin::default()))
        .unwrap()
        .filter(Box::new(PartitionFilter::new()))
        .unwrap()
        .filter(Box::new(RetryFilter::new()))
        .unwrap();

    // Outer filter takes retry keys, inner takes partition keys, the
    // plugin takes the rest.
    builder.config("retries", "3").unwrap();
    builder.config("partition", "1").unwrap();
    builder.config("size", "1M").unwrap();
    builder.config("byte", "0x00").unwrap();
    assert!(builder.config("unknown-everywhere", "x").is_err());
    builder.config_complete().unwrap();

    let chain = builder.ready().unwrap();
    assert_eq!(chain.plugin_name(), "fill");
}
