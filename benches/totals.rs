use criterion::{criterion_group, criterion_main, Criterion};
use mdao::{
    solver::{BlockGsOptions, NewtonOptions},
    testing::*,
    Mode, Problem,
};

const CHAIN_LENGTH: usize = 50;

fn chain_problem() -> Problem {
    let mut problem = Problem::new(scale_chain(CHAIN_LENGTH, 1.01));
    problem.setup().unwrap();
    problem.run_model().unwrap();
    problem
}

fn sellar_problem(newton: bool) -> Problem {
    let solver = if newton {
        NewtonOptions::default().into()
    } else {
        BlockGsOptions::default().set_maxiter(50).to_owned().into()
    };
    let mut problem = Problem::new(sellar(Some(solver)));
    problem.setup().unwrap();
    problem
}

fn chain(c: &mut Criterion) {
    let last = format!("c{}.y", CHAIN_LENGTH - 1);

    let mut problem = chain_problem();
    c.bench_function("chain totals fwd", |b| {
        b.iter(|| {
            problem
                .compute_totals_with_mode(&[last.as_str()], &["c0.x"], Mode::Fwd)
                .unwrap()
        })
    });

    let mut problem = chain_problem();
    c.bench_function("chain totals rev", |b| {
        b.iter(|| {
            problem
                .compute_totals_with_mode(&[last.as_str()], &["c0.x"], Mode::Rev)
                .unwrap()
        })
    });
}

fn sellar_run(c: &mut Criterion) {
    let mut problem = sellar_problem(false);
    c.bench_function("sellar run NLBGS", |b| {
        b.iter(|| assert!(problem.run_model().unwrap().converged()))
    });

    let mut problem = sellar_problem(true);
    c.bench_function("sellar run Newton", |b| {
        b.iter(|| assert!(problem.run_model().unwrap().converged()))
    });
}

fn sellar_totals(c: &mut Criterion) {
    let of = ["y1", "y2"];
    let wrt = ["x", "z"];

    for mode in [Mode::Fwd, Mode::Rev] {
        let mut problem = sellar_problem(true);
        problem.run_model().unwrap();

        c.bench_function(&format!("sellar totals {mode:?}"), |b| {
            b.iter(|| problem.compute_totals_with_mode(&of, &wrt, mode).unwrap())
        });
    }
}

criterion_group!(totals, chain, sellar_run, sellar_totals);
criterion_main!(totals);
