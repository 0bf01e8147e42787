use crate::autograd::Variable;
use crate::tensor::TensorElem;
use std::fmt::Debug;

/// A trainable tensor seen through a rank-erased view.
///
/// Optimizers and checkpointing walk parameters of mixed rank (`[O, C, kH, kW]` kernels, `[C]`
/// biases, `[C, H, W]` peepholes) through this one interface.
pub trait Parameter<T: TensorElem> {
    fn shape(&self) -> Vec<usize>;
    fn values(&self) -> &[T];
    fn values_mut(&mut self) -> &mut [T];
    /// Copy of the accumulated gradient, `None` if no gradient reached the parameter.
    fn grad(&self) -> Option<Vec<T>>;
    fn zero_grad(&mut self);

    fn size(&self) -> usize {
        self.values().len()
    }
}

impl<T: TensorElem + 'static, const RANK: usize> Parameter<T> for Variable<T, RANK> {
    fn shape(&self) -> Vec<usize> {
        self.data.shape().to_vec()
    }

    fn values(&self) -> &[T] {
        self.data.data()
    }

    fn values_mut(&mut self) -> &mut [T] {
        self.data.data_mut()
    }

    fn grad(&self) -> Option<Vec<T>> {
        self.grad.borrow().as_ref().map(|g| g.data().to_vec())
    }

    fn zero_grad(&mut self) {
        *self.grad.borrow_mut() = None;
    }
}

/// A Module trait for Neural Network layers.
///
/// Every layer exposes its parameters by name through [`Module::visit_parameters`]. Names are
/// dotted paths (`sa_convlstm1.cell.conv.weight`), built by joining the `prefix` handed down by
/// the parent with the local field name.
///
/// Modules are not `Send`: their parameters carry `Rc` gradient cells shared with the graph.
pub trait Module<T: TensorElem>: Debug {
    /// Calls `f` once per parameter, in a stable order.
    fn visit_parameters(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut dyn Parameter<T>));

    /// Drops every accumulated gradient.
    fn zero_grad(&mut self) {
        self.visit_parameters("", &mut |_, p| p.zero_grad());
    }

    /// Total number of scalar parameters.
    fn num_parameters(&mut self) -> usize {
        let mut total = 0;
        self.visit_parameters("", &mut |_, p| total += p.size());
        total
    }

    /// Parameter names in visiting order.
    fn parameter_names(&mut self) -> Vec<String> {
        let mut names = Vec::new();
        self.visit_parameters("", &mut |name, _| names.push(name.to_string()));
        names
    }
}

/// Joins a parent prefix and a child name with a dot.
pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}
