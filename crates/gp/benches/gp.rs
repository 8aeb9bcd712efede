use criterion::{criterion_group, criterion_main, Criterion};
use linfa::prelude::{Dataset, Fit};
use ndarray::{array, Array, Array2, Axis};
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand_xoshiro::Xoshiro256Plus;
use uqbox_gp::covariance_models::{Matern52Kernel, StationaryCovariance};
use uqbox_gp::trend_models::ConstantTrend;
use uqbox_gp::{FactorizationMethod, GaussianProcessRegression, GpParams};

fn griewank(x: &Array2<f64>) -> Array2<f64> {
    let dim = x.ncols();
    let d = Array::linspace(1., dim as f64, dim).mapv(|v| v.sqrt());
    x.map_axis(Axis(1), |r| {
        r.mapv(|v| v * v).sum() / 4000. - (&r / &d).mapv(|v| v.cos()).fold(1., |acc, v| acc * v)
            + 1.0
    })
    .insert_axis(Axis(1))
}

fn criterion_gp(c: &mut Criterion) {
    let nts = [500, 1000, 2000];

    let mut group = c.benchmark_group("gp");
    group.sample_size(10);
    for nt in nts {
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let xt = Array::random_using((nt, 2), Uniform::new(-600., 600.), &mut rng);
        let yt = griewank(&xt);
        let xv = Array::random_using((100, 2), Uniform::new(-600., 600.), &mut rng);

        for method in [FactorizationMethod::Cholesky, FactorizationMethod::Hierarchical] {
            let params = GpParams::new(
                StationaryCovariance::new(Matern52Kernel(), 2)
                    .with_scale(array![100., 100.])
                    .with_nugget(1e-6),
                ConstantTrend(),
            )
            .factorization_method(method);
            group.bench_function(format!("fit {method:?} {nt}"), |b| {
                b.iter(|| {
                    std::hint::black_box(
                        params
                            .fit(&Dataset::new(xt.to_owned(), yt.to_owned()))
                            .expect("GP fit error"),
                    )
                });
            });

            let res = GaussianProcessRegression::new(
                params
                    .fit(&Dataset::new(xt.to_owned(), yt.to_owned()))
                    .expect("GP fit error"),
            )
            .run()
            .expect("GP regression error");
            group.bench_function(format!("variance {method:?} {nt}"), |b| {
                b.iter(|| {
                    std::hint::black_box(
                        res.conditional()
                            .conditional_variance(&xv)
                            .expect("GP variance error"),
                    )
                });
            });
        }
    }
    group.finish();
}

criterion_group!(benches, criterion_gp);
criterion_main!(benches);
