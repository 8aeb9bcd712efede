use linfa::prelude::*;
use ndarray::{arr2, array, concatenate, Array, Array2, Axis};
use uqbox_gp::covariance_models::{SquaredExponentialKernel, StationaryCovariance};
use uqbox_gp::{GaussianProcessRegression, Kriging};

fn xsinx(x: &Array2<f64>) -> Array2<f64> {
    (x - 3.5) * ((x - 3.5) / std::f64::consts::PI).mapv(|v| v.sin())
}

fn main() {
    env_logger::init();
    let xt = arr2(&[[0.0], [5.0], [10.0], [15.0], [18.0], [20.0], [25.0]]);
    let yt = xsinx(&xt);

    println!("Train kriging surrogate of 'xsinx' at {}", xt.column(0));
    let params = Kriging::params(1).covariance(
        StationaryCovariance::new(SquaredExponentialKernel(), 1)
            .with_scale(array![4.])
            .with_amplitude(array![10.]),
    );
    let fitted = params.fit(&Dataset::new(xt, yt)).expect("GP fitting");
    println!(
        "Log-likelihood {}, reduced log-likelihood {}",
        fitted.log_likelihood(),
        fitted.reduced_log_likelihood()
    );
    let result = GaussianProcessRegression::new(fitted)
        .run()
        .expect("GP regression");

    let xtest = Array::linspace(0., 25., 26).insert_axis(Axis(1));
    let ytest = xsinx(&xtest);
    let (ypred, yvar) = result
        .conditional()
        .conditional_mean_and_variance(&xtest)
        .expect("Kriging prediction");

    println!("Compute prediction errors (x, err(x), sigma(x))");
    println!(
        "{}",
        concatenate![Axis(1), xtest, ypred - ytest, yvar.mapv(|v| v.sqrt())]
    );
}
