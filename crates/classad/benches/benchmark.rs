use std::hint::black_box;

use criterion::measurement::WallTime;
use criterion::{BenchmarkGroup, BenchmarkId, Criterion, criterion_group, criterion_main};

use classad::{ClassAd, Expression, Scope};

const MATCH_EXPR: &str = "(job.RequestCpus <= glideinCpus(glidein)) && \
    (job.RequestMemory <= glidein.attrs.GLIDEIN_MaxMemMBs) && \
    ((job.DESIRED_Sites == undefined) || (glidein.attrs.GLIDEIN_Site in split(job.DESIRED_Sites)))";

fn bench_parse(c: &mut BenchmarkGroup<WallTime>) {
    c.bench_function("parse match expression", |bencher| {
        bencher.iter(|| Expression::parse(black_box(MATCH_EXPR)));
    });
    c.bench_function("parse constraint", |bencher| {
        bencher.iter(|| Expression::parse(black_box("MyType == \"glidefactory\" && GLIDEIN_CPUS > 1")));
    });
}

fn bench_eval(c: &mut BenchmarkGroup<WallTime>) {
    let expr = Expression::parse(MATCH_EXPR).unwrap();
    let entry = ClassAd::new("glidefactory", "entry@glidein@factory")
        .with("GLIDEIN_CPUS", 8)
        .with("GLIDEIN_MaxMemMBs", 16000)
        .with("GLIDEIN_Site", "SiteB");

    for site_count in [1, 10, 100] {
        let sites: Vec<String> = (0..site_count).map(|i| format!("Site{i}")).collect();
        let job = ClassAd::new("Job", "")
            .with("RequestCpus", 1)
            .with("RequestMemory", 2048)
            .with("DESIRED_Sites", sites.join(","));
        c.bench_with_input(
            BenchmarkId::new("evaluate match expression", site_count),
            &job,
            |bencher, job| {
                bencher.iter(|| {
                    let wrapper = GlideinRecord { attrs: &entry };
                    let scope = Scope::strict()
                        .bind_record("job", job)
                        .bind_record("glidein", &wrapper);
                    expr.eval_bool(&scope)
                });
            },
        );
    }
}

struct GlideinRecord<'a> {
    attrs: &'a ClassAd,
}

impl classad::Record for GlideinRecord<'_> {
    fn lookup(&self, name: &str) -> Option<classad::EvalValue<'_>> {
        match name {
            "attrs" => Some(classad::EvalValue::Record(self.attrs)),
            _ => None,
        }
    }
}

pub fn benchmark_expressions(c: &mut Criterion) {
    let mut group = c.benchmark_group("expression");
    bench_parse(&mut group);
    bench_eval(&mut group);
}

criterion_group!(expressions, benchmark_expressions);

criterion_main!(expressions);
