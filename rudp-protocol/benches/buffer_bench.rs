use bytes::{BufMut, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rudp_protocol::buffer::{Buffer, BufferType, ChunkReader, DataTag, DEFAULT_CAPACITY};
use rudp_protocol::sequence::{less, BufferId};

fn full_data_buffer() -> Buffer {
    let mut buffer = Buffer::new(BufferType::Data, DEFAULT_CAPACITY);
    buffer.set_id(BufferId::new(1000));
    for id in 0..8 {
        buffer.push_update(id);
    }
    buffer.push_chunk(DataTag::NewSignal, |out| {
        out.fill(0xA5);
        out.len()
    });
    buffer
}

fn bench_buffer_serialize(c: &mut Criterion) {
    let buffer = full_data_buffer();

    let mut group = c.benchmark_group("buffer");
    group.throughput(Throughput::Bytes(buffer.size() as u64));
    group.bench_function("serialize", |b| {
        b.iter(|| {
            let bytes = black_box(&buffer).to_bytes();
            black_box(bytes);
        });
    });

    let bytes = buffer.to_bytes();
    group.bench_function("parse", |b| {
        b.iter(|| {
            let buffer = Buffer::from_bytes(black_box(&bytes), DEFAULT_CAPACITY).unwrap();
            black_box(buffer);
        });
    });
    group.finish();
}

fn bench_chunk_packing(c: &mut Criterion) {
    let mut frame = BytesMut::new();
    frame.put_bytes(0x3C, 200);

    c.bench_function("pack_small_chunks", |b| {
        b.iter(|| {
            let mut buffer = Buffer::new(BufferType::Data, DEFAULT_CAPACITY);
            while buffer.data_free_size() > 16 {
                buffer.push_chunk(DataTag::NewSignal, |out| {
                    let n = frame.len().min(out.len());
                    out[..n].copy_from_slice(&frame[..n]);
                    n
                });
            }
            black_box(buffer);
        });
    });

    let buffer = full_data_buffer();
    c.bench_function("read_chunks", |b| {
        b.iter(|| {
            let mut reader = ChunkReader::new(black_box(buffer.payload()));
            while let Some(Ok((_, rest))) = reader.next_tag() {
                reader.consume(rest.len());
            }
        });
    });
}

fn bench_sequence(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_id");

    group.bench_function("increment", |b| {
        let mut id = BufferId::new(1000);
        b.iter(|| {
            id.increment();
            black_box(&id);
        });
    });

    group.bench_function("less", |b| {
        b.iter(|| black_box(less(black_box(u32::MAX - 5), black_box(10))));
    });

    group.finish();
}

criterion_group!(benches, bench_buffer_serialize, bench_chunk_packing, bench_sequence);
criterion_main!(benches);
