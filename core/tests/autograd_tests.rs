use sa_convlstm::autograd::Variable;
use sa_convlstm::autograd::functional::numerical_grad;
use sa_convlstm::tensor;
use sa_convlstm::tensor::Tensor;

#[test]
fn test_scalar_autograd() {
    // f(x) = x^2 + 3x
    // f'(x) = 2x + 3
    // Let x = 2.0
    // f(2) = 4 + 6 = 10
    // f'(2) = 4 + 3 = 7

    let x = Variable::new(Tensor::<f32, 1>::new(vec![2.0], [1]).unwrap());

    let x_sq = (&x * &x).unwrap();
    let three = Variable::new(tensor!([3.0], [1]));
    let three_x = (&three * &x).unwrap();
    let y = (&x_sq + &three_x).unwrap();

    assert_eq!(y.data.data()[0], 10.0);

    y.backward().unwrap();

    // x contributes to x_sq (2x) and three_x (3)
    let x_grad = x.grad_tensor().unwrap();
    assert_eq!(x_grad.data()[0], 7.0);
}

#[test]
fn test_matmul_autograd() {
    // C = A @ B
    // A: [1, 2] = [1, 2]
    // B: [2, 1] = [3, 4]
    // C: [1, 1] = 1*3 + 2*4 = 11
    // dC/dA = B^T = [3, 4]
    // dC/dB = A^T = [1, 2]

    let a = Variable::new(Tensor::<f32, 2>::new(vec![1.0, 2.0], [1, 2]).unwrap());
    let b = Variable::new(Tensor::<f32, 2>::new(vec![3.0, 4.0], [2, 1]).unwrap());

    let c = a.matmul(&b).unwrap();
    assert_eq!(c.data.data()[0], 11.0);

    c.backward().unwrap();

    assert_eq!(a.grad_tensor().unwrap().data(), &[3.0, 4.0]);
    assert_eq!(b.grad_tensor().unwrap().data(), &[1.0, 2.0]);
}

#[test]
fn test_conv2d_gradients_match_finite_differences() {
    let x = Tensor::<f64, 4>::new((0..32).map(|v| (v as f64 * 0.37).sin()).collect(), [1, 2, 4, 4])
        .unwrap();
    let w = Tensor::<f64, 4>::new((0..54).map(|v| (v as f64 * 0.11).cos()).collect(), [3, 2, 3, 3])
        .unwrap();

    let loss = |x: &Variable<f64, 4>, w: &Variable<f64, 4>| {
        x.conv2d(w, [1, 1], [1, 1], [1, 1])?.tanh().sum().mean()
    };

    let xv = Variable::new(x.clone());
    let wv = Variable::new(w.clone());
    loss(&xv, &wv).unwrap().backward().unwrap();

    let numeric_x = numerical_grad(
        |x| Ok(loss(&Variable::new(x.clone()), &Variable::new(w.clone()))?.data.data()[0]),
        &x,
        1e-6,
    )
    .unwrap();
    let numeric_w = numerical_grad(
        |w| Ok(loss(&Variable::new(x.clone()), &Variable::new(w.clone()))?.data.data()[0]),
        &w,
        1e-6,
    )
    .unwrap();

    for (a, n) in xv.grad_tensor().unwrap().data().iter().zip(numeric_x.data()) {
        assert!((a - n).abs() < 1e-6, "input grad {a} vs {n}");
    }
    for (a, n) in wv.grad_tensor().unwrap().data().iter().zip(numeric_w.data()) {
        assert!((a - n).abs() < 1e-6, "weight grad {a} vs {n}");
    }
}

#[test]
fn test_gate_chain_gradient() {
    // c = sigmoid(f) * c_prev + sigmoid(i) * tanh(g), one LSTM cell update
    let f = Variable::new(tensor!([0.5_f64, -1.0], [2]));
    let i = Variable::new(tensor!([1.5_f64, 0.0], [2]));
    let g = Variable::new(tensor!([-0.3_f64, 0.8], [2]));
    let c_prev = Variable::new(tensor!([2.0_f64, -1.0], [2]));

    let keep = (&f.sigmoid() * &c_prev).unwrap();
    let write = (&i.sigmoid() * &g.tanh()).unwrap();
    let c = (&keep + &write).unwrap();
    c.sum().backward().unwrap();

    let sigmoid = |v: f64| 1.0 / (1.0 + (-v).exp());
    let df = f.grad_tensor().unwrap();
    // d/df sigmoid(f) * c_prev = sigmoid'(f) * c_prev
    let expected = sigmoid(0.5) * (1.0 - sigmoid(0.5)) * 2.0;
    assert!((df.data()[0] - expected).abs() < 1e-12);

    let dg = g.grad_tensor().unwrap();
    let expected = sigmoid(0.0) * (1.0 - 0.8_f64.tanh().powi(2));
    assert!((dg.data()[1] - expected).abs() < 1e-12);

    assert!((c_prev.grad_tensor().unwrap().data()[1] - sigmoid(-1.0)).abs() < 1e-12);
}

#[test]
fn test_shape_errors_propagate() {
    let a = Variable::new(Tensor::<f32, 2>::zeros([2, 3]));
    let b = Variable::new(Tensor::<f32, 2>::zeros([3, 2]));
    assert!((&a + &b).is_err());
    assert!(a.narrow(1, 2, 2).is_err());
    assert!(Variable::cat(&[&a, &b], 1).is_err());
}
