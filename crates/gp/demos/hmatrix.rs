use linfa::prelude::*;
use ndarray::{array, Array2, Axis};
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand_xoshiro::Xoshiro256Plus;
use std::time::Instant;
use uqbox_gp::covariance_models::{Matern32Kernel, StationaryCovariance};
use uqbox_gp::trend_models::LinearTrend;
use uqbox_gp::{
    FactorizationMethod, FactorizationParams, GaussianProcessRegression, GpParams, HMatrixParams,
};

fn main() {
    env_logger::init();
    let nt = 3000;
    let mut rng = Xoshiro256Plus::seed_from_u64(42);
    let xt = Array2::<f64>::random_using((nt, 2), Uniform::new(0., 1.), &mut rng);
    let yt = xt
        .map_axis(Axis(1), |r| (6. * r[0]).sin() * (4. * r[1]).cos() + r[0])
        .insert_axis(Axis(1));
    let xv = Array2::<f64>::random_using((200, 2), Uniform::new(0., 1.), &mut rng);

    let params = GpParams::new(
        StationaryCovariance::new(Matern32Kernel(), 2)
            .with_scale(array![0.3, 0.3])
            .with_nugget(1e-4),
        LinearTrend(),
    );

    let mut means = vec![];
    for method in [FactorizationMethod::Cholesky, FactorizationMethod::Hierarchical] {
        let now = Instant::now();
        let fitted = params
            .clone()
            .factorization(
                FactorizationParams::default()
                    .method(method)
                    .hmat(HMatrixParams::default().leaf_size(64)),
            )
            .fit(&Dataset::new(xt.to_owned(), yt.to_owned()))
            .expect("GP fitting");
        let storage = fitted.factor().storage();
        let result = GaussianProcessRegression::new(fitted)
            .run()
            .expect("GP regression");
        println!(
            "{} factor: {} stored scalars, log-likelihood {:.6}, fitted in {:?}",
            result.kind(),
            storage,
            result.log_likelihood(),
            now.elapsed()
        );
        means.push(
            result
                .conditional()
                .conditional_mean(&xv)
                .expect("prediction"),
        );
    }
    let diff = (&means[0] - &means[1]).mapv(f64::abs);
    println!(
        "Max prediction difference between factorizations: {:e}",
        diff.fold(0., |acc: f64, v| acc.max(*v))
    );
}
