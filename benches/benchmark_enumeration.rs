use std::net::{IpAddr, Ipv4Addr};

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use sweepscan::service::{DefaultClassifier, ServiceClassifier};
use sweepscan::target::{CidrBlock, PortRange, Protocol, Target};

fn enumerate_host_ports(target: Target, ports: PortRange) -> usize {
    target.units(ports, Protocol::Tcp).count()
}

fn enumerate_block(block: CidrBlock) -> usize {
    block.addresses().count()
}

fn classify_banners(banners: &[&[u8]]) -> usize {
    banners
        .iter()
        .map(|banner| DefaultClassifier.identify(banner, 2222))
        .filter(|label| !label.is_unknown())
        .count()
}

fn criterion_benchmark(c: &mut Criterion) {
    let host = Target::Host(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let network: Target = "10.0.0.0/24".parse().unwrap();
    let block = CidrBlock::parse("10.0.0.0/16").unwrap();

    c.bench_function("enumerate all ports of one host", |b| {
        b.iter(|| enumerate_host_ports(black_box(host), black_box(PortRange::default())));
    });

    let mut group = c.benchmark_group("enumerate block");
    group.sample_size(10);
    group.bench_function("/24 x 1-1000", |b| {
        b.iter(|| enumerate_host_ports(black_box(network), black_box(PortRange::new(1, 1000))));
    });
    group.bench_function("/16 addresses", |b| {
        b.iter(|| enumerate_block(black_box(block)));
    });
    group.finish();

    let banners: [&[u8]; 4] = [
        b"SSH-2.0-OpenSSH_8.9p1 Ubuntu-3",
        b"220 ProFTPD 1.3.5 Server ready",
        b"HTTP/1.1 200 OK\r\nServer: nginx/1.18.0",
        b"\x00\x01\x02 binary noise",
    ];
    c.bench_function("classify banners", |b| {
        b.iter(|| classify_banners(black_box(&banners)));
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
